use sqlparser::ast::{
    self, AssignmentTarget, Expr, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::partition::Bucket;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterService {
        id: Ulid,
        provider_id: Ulid,
    },
    PublishSlots {
        service_id: Ulid,
        slots: Vec<(Ulid, Ms)>, // (id, appointment_date)
    },
    Claim {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
        by: Role,
    },
    SelectServices,
    SelectOpenSlots {
        service_id: Ulid,
        from: Option<Ms>,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectMyAppointments {
        now: Option<Ms>,
        bucket: Option<Bucket>,
        limit: Option<usize>,
        offset: usize,
    },
    /// `LISTEN service_<id>`: receive that service's events on this connection.
    Listen {
        service_id: Ulid,
    },
}

/// Notification channel name for a service.
pub fn service_channel(service_id: Ulid) -> String {
    format!("{SERVICE_CHANNEL_PREFIX}{service_id}")
}

const SERVICE_CHANNEL_PREFIX: &str = "service_";

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN") {
        return parse_listen(channel);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The rest of `sql` after a leading keyword, matched case-insensitively.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace)).then_some(rest)
}

fn parse_listen(channel: &str) -> Result<Command, SqlError> {
    let channel = channel.trim().trim_end_matches(';').trim().trim_matches('"');
    let id = channel
        .strip_prefix(SERVICE_CHANNEL_PREFIX)
        .ok_or_else(|| SqlError::Parse(format!("invalid channel: {channel} (expected service_{{id}})")))?;
    let service_id =
        Ulid::from_string(id).map_err(|e| SqlError::Parse(format!("bad ULID in channel: {e}")))?;
    Ok(Command::Listen { service_id })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "services" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("services accept one row per INSERT".into()));
            }
            let values = &rows[0];
            if values.len() < 2 {
                return Err(SqlError::WrongArity("services", 2, values.len()));
            }
            Ok(Command::RegisterService {
                id: parse_ulid_expr(&values[0])?,
                provider_id: parse_ulid_expr(&values[1])?,
            })
        }
        "appointments" => {
            let mut service_id = None;
            let mut slots = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 3 {
                    return Err(SqlError::WrongArity("appointments", 3, row.len()));
                }
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let id = parse_ulid_expr(&row[0]).map_err(at_row)?;
                let sid = parse_ulid_expr(&row[1]).map_err(at_row)?;
                let date = parse_i64_expr(&row[2]).map_err(at_row)?;
                match service_id {
                    None => service_id = Some(sid),
                    Some(first) if first != sid => {
                        return Err(SqlError::Unsupported(
                            "one INSERT publishes slots for a single service".into(),
                        ));
                    }
                    Some(_) => {}
                }
                slots.push((id, date));
            }
            let service_id = service_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::PublishSlots { service_id, slots })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE must set exactly one column".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };
    if column.as_deref() != Some("status") {
        return Err(SqlError::Unsupported("only status can be updated".into()));
    }

    match parse_status_expr(&assignment.value)? {
        AppointmentStatus::Scheduled => Ok(Command::Claim { id }),
        AppointmentStatus::CancelledByUser => Ok(Command::Cancel { id, by: Role::User }),
        AppointmentStatus::CancelledByService => Ok(Command::Cancel {
            id,
            by: Role::Provider,
        }),
        other => Err(SqlError::Unsupported(format!("status cannot be set to {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "services" => {
            filters.allow(&[])?;
            Ok(Command::SelectServices)
        }
        "appointments" => {
            if let Some(id) = filters.id {
                filters.allow(&["id"])?;
                return Ok(Command::SelectAppointment { id });
            }
            filters.allow(&["service_id", "appointment_date"])?;
            Ok(Command::SelectOpenSlots {
                service_id: filters.service_id.ok_or(SqlError::MissingFilter("service_id"))?,
                from: filters.from,
            })
        }
        "my_appointments" => {
            filters.allow(&["now", "bucket"])?;
            let (limit, offset) = parse_limit_clause(query.limit_clause.as_ref())?;
            Ok(Command::SelectMyAppointments {
                now: filters.now,
                bucket: filters.bucket,
                limit,
                offset,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    service_id: Option<Ulid>,
    from: Option<Ms>,
    now: Option<Ms>,
    bucket: Option<Bucket>,
}

impl Filters {
    fn present(&self) -> impl Iterator<Item = &'static str> {
        [
            ("id", self.id.is_some()),
            ("service_id", self.service_id.is_some()),
            ("appointment_date", self.from.is_some()),
            ("now", self.now.is_some()),
            ("bucket", self.bucket.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
    }

    /// Reject any filter outside `allowed` for the table being read.
    fn allow(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.present().find(|name| !allowed.contains(name)) {
            Some(name) => Err(SqlError::Unsupported(format!("cannot filter on {name} here"))),
            None => Ok(()),
        }
    }
}

/// Only `AND`-joined `column = value` (and `appointment_date >= value`)
/// filters are understood; anything else is an error, never ignored.
fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let unsupported = || SqlError::Unsupported(format!("filter: {expr}"));
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                match expr_column_name(left).as_deref() {
                    Some("id") => filters.id = Some(parse_ulid_expr(right)?),
                    Some("service_id") => filters.service_id = Some(parse_ulid_expr(right)?),
                    Some("now") => filters.now = Some(parse_i64_expr(right)?),
                    Some("bucket") => {
                        let s = parse_string_expr(right)?;
                        filters.bucket = Some(
                            Bucket::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad bucket: {s}")))?,
                        );
                    }
                    _ => return Err(unsupported()),
                }
                Ok(())
            }
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("appointment_date") => {
                filters.from = Some(parse_i64_expr(right)?);
                Ok(())
            }
            _ => Err(unsupported()),
        },
        _ => Err(unsupported()),
    }
}

fn parse_limit_clause(clause: Option<&LimitClause>) -> Result<(Option<usize>, usize), SqlError> {
    let Some(clause) = clause else {
        return Ok((None, 0));
    };
    let (limit, offset) = match clause {
        LimitClause::LimitOffset { limit, offset, .. } => {
            (limit.as_ref(), offset.as_ref().map(|o| &o.value))
        }
        LimitClause::OffsetCommaLimit { offset, limit } => (Some(limit), Some(offset)),
    };
    let limit = limit.map(parse_usize_expr).transpose()?;
    let offset = offset.map(parse_usize_expr).transpose()?.unwrap_or(0);
    Ok((limit, offset))
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid count")))
}

/// A status by name (`'scheduled'`) or by ordinal (`1`).
fn parse_status_expr(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => AppointmentStatus::parse(s)
            .ok_or_else(|| SqlError::Parse(format!("unknown status: {s}"))),
        Some(Value::Number(n, _)) => n
            .parse::<u8>()
            .ok()
            .and_then(AppointmentStatus::from_ordinal)
            .ok_or_else(|| SqlError::Parse(format!("unknown status ordinal: {n}"))),
        Some(value) => Err(SqlError::Parse(format!("expected status, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_register_service() {
        let sql = format!("INSERT INTO services (id, provider_id) VALUES ('{A}', '{B}')");
        match parse_sql(&sql).unwrap() {
            Command::RegisterService { id, provider_id } => {
                assert_eq!(id.to_string(), A);
                assert_eq!(provider_id.to_string(), B);
            }
            cmd => panic!("expected RegisterService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_publish_batch() {
        let sql = format!(
            "INSERT INTO appointments (id, service_id, appointment_date) VALUES \
             ('{A}', '{B}', 1742292000000), ('{B}', '{B}', 1742295600000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::PublishSlots { service_id, slots } => {
                assert_eq!(service_id.to_string(), B);
                assert_eq!(slots.len(), 2);
                assert_eq!(slots[0].1, 1_742_292_000_000);
                assert_eq!(slots[1].1, 1_742_295_600_000);
            }
            cmd => panic!("expected PublishSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn publish_across_services_is_rejected() {
        let sql = format!(
            "INSERT INTO appointments (id, service_id, appointment_date) VALUES \
             ('{A}', '{A}', 1000), ('{B}', '{B}', 2000)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn publish_bad_row_reports_index() {
        let sql = format!(
            "INSERT INTO appointments (id, service_id, appointment_date) VALUES \
             ('{A}', '{B}', 1000), ('nope', '{B}', 2000)"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("row 1"), "{err}");
    }

    #[test]
    fn parse_claim_by_name_and_ordinal() {
        let by_name = format!("UPDATE appointments SET status = 'scheduled' WHERE id = '{A}'");
        let by_ordinal = format!("UPDATE appointments SET status = 1 WHERE id = '{A}'");
        for sql in [by_name, by_ordinal] {
            match parse_sql(&sql).unwrap() {
                Command::Claim { id } => assert_eq!(id.to_string(), A),
                cmd => panic!("expected Claim, got {cmd:?}"),
            }
        }
    }

    #[test]
    fn parse_cancel_roles() {
        let sql = format!("UPDATE appointments SET status = 'CANCELLED_BY_USER' WHERE id = '{A}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::Cancel { by: Role::User, .. }
        ));

        let sql = format!("UPDATE appointments SET status = 4 WHERE id = '{A}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::Cancel { by: Role::Provider, .. }
        ));
    }

    #[test]
    fn done_and_open_cannot_be_written() {
        for status in ["'done'", "'open'", "2", "0"] {
            let sql = format!("UPDATE appointments SET status = {status} WHERE id = '{A}'");
            assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))), "{status}");
        }
    }

    #[test]
    fn update_other_column_is_rejected() {
        let sql = format!("UPDATE appointments SET user_id = '{B}' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_without_id_is_rejected() {
        let sql = "UPDATE appointments SET status = 'scheduled'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_select_open_slots() {
        let sql = format!(
            "SELECT * FROM appointments WHERE service_id = '{B}' AND appointment_date >= 1000"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectOpenSlots { service_id, from } => {
                assert_eq!(service_id.to_string(), B);
                assert_eq!(from, Some(1000));
            }
            cmd => panic!("expected SelectOpenSlots, got {cmd:?}"),
        }

        let sql = format!("SELECT * FROM appointments WHERE service_id = '{B}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectOpenSlots { from: None, .. }
        ));
    }

    #[test]
    fn select_appointments_needs_a_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM appointments"),
            Err(SqlError::MissingFilter("service_id"))
        ));
    }

    #[test]
    fn parse_select_by_id() {
        let sql = format!("SELECT * FROM appointments WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectAppointment { .. }));
    }

    #[test]
    fn parse_select_services() {
        assert_eq!(parse_sql("SELECT * FROM services").unwrap(), Command::SelectServices);
    }

    #[test]
    fn parse_my_appointments_defaults() {
        assert_eq!(
            parse_sql("SELECT * FROM my_appointments").unwrap(),
            Command::SelectMyAppointments {
                now: None,
                bucket: None,
                limit: None,
                offset: 0,
            }
        );
    }

    #[test]
    fn parse_my_appointments_page() {
        let sql = "SELECT * FROM my_appointments WHERE now = 1742292000000 AND bucket = 'past' LIMIT 10 OFFSET 20";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectMyAppointments {
                now: Some(1_742_292_000_000),
                bucket: Some(Bucket::Past),
                limit: Some(10),
                offset: 20,
            }
        );
    }

    #[test]
    fn bad_bucket_errors() {
        let sql = "SELECT * FROM my_appointments WHERE bucket = 'someday'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn unknown_filter_column_is_rejected() {
        for filter in [String::from("status = 'open'"), format!("user_id = '{A}'")] {
            let sql = format!("SELECT * FROM appointments WHERE service_id = '{B}' AND {filter}");
            assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))), "{filter}");
        }
    }

    #[test]
    fn unknown_filter_operator_is_rejected() {
        let sql = format!(
            "SELECT * FROM appointments WHERE service_id = '{B}' AND appointment_date < 1000"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));

        let sql = format!("SELECT * FROM appointments WHERE service_id = '{B}' OR id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn filter_for_another_table_is_rejected() {
        let sql = "SELECT * FROM services WHERE now = 1000";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));

        let sql = format!("SELECT * FROM my_appointments WHERE service_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));

        let sql = format!("SELECT * FROM appointments WHERE id = '{A}' AND service_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_listen_channel() {
        for sql in [format!("LISTEN service_{A}"), format!("listen \"service_{A}\";")] {
            match parse_sql(&sql).unwrap() {
                Command::Listen { service_id } => {
                    assert_eq!(service_channel(service_id), format!("service_{A}"));
                }
                cmd => panic!("expected Listen, got {cmd:?}"),
            }
        }
    }

    #[test]
    fn listen_bad_channel_errors() {
        assert!(matches!(parse_sql(&format!("LISTEN resource_{A}")), Err(SqlError::Parse(_))));
        assert!(matches!(parse_sql("LISTEN service_nope"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "foobar"));
    }

    #[test]
    fn delete_is_unsupported() {
        let sql = format!("DELETE FROM appointments WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
