use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::{caller_identity, SlotwiseAuthSource};
use crate::engine::{self, Engine, EngineError};
use crate::lifecycle::{effective_status, now_ms};
use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;
use crate::observability;
use crate::partition::{Bucket, Classified};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// A `LISTEN` held by one connection.
struct Subscription {
    channel: String,
    service_id: Ulid,
    rx: broadcast::Receiver<Event>,
}

/// One handler per connection, so subscriptions are per connection too.
pub struct SlotwiseHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotwiseQueryParser>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SlotwiseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotwiseQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    async fn listen(&self, engine: &Engine, service_id: Ulid) -> PgWireResult<()> {
        if engine.get_service(&service_id).is_none() {
            return Err(engine_err(EngineError::NotFound(service_id)));
        }
        let mut subs = self.subscriptions.lock().await;
        if !subs.iter().any(|s| s.service_id == service_id) {
            subs.push(Subscription {
                channel: sql::service_channel(service_id),
                service_id,
                rx: engine.notify.subscribe(service_id),
            });
        }
        Ok(())
    }

    /// Events received on this connection's channels since the last call.
    async fn drain_notifications(&self) -> Vec<(String, Event)> {
        let mut subs = self.subscriptions.lock().await;
        let mut out = Vec::new();
        for sub in subs.iter_mut() {
            loop {
                match sub.rx.try_recv() {
                    Ok(event) => out.push((sub.channel.clone(), event)),
                    Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                        tracing::warn!("{} dropped {missed} notifications", sub.channel);
                    }
                    Err(_) => break,
                }
            }
        }
        out
    }

    /// Send pending notifications ahead of the statement's own response.
    /// A listening connection sees them with each statement it runs.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        for (channel, event) in self.drain_notifications().await {
            let payload = serde_json::to_string(&event)
                .map_err(|e| user_error("XX000", format!("notification payload: {e}")))?;
            let message = NotificationResponse::new(std::process::id() as i32, channel, payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }

    /// Run one statement, then flush notifications whatever its outcome.
    async fn respond<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(&*client, query).await;
        self.deliver_notifications(client).await?;
        response
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let caller = caller_identity(client.metadata().get("user").map(String::as_str));
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(&engine, caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: Option<Ulid>,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::RegisterService { id, provider_id } => {
                engine
                    .register_service(id, provider_id, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::PublishSlots { service_id, slots } => {
                let created = engine::publish_slots(engine, caller, service_id, &slots)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(created.len()),
                ))
            }
            Command::Claim { id } => {
                engine::claim(engine, id, caller).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::Cancel { id, by } => {
                engine::cancel(engine, id, caller, by, now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::Listen { service_id } => {
                self.listen(engine, service_id).await?;
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::SelectServices => {
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_services()
                    .await
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.provider_id.to_string())?;
                        encoder.encode_field(&(s.appointment_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectOpenSlots { service_id, from } => {
                let slots = engine::list_open_slots(engine, service_id, from)
                    .await
                    .map_err(engine_err)?;
                Ok(appointment_rows(&slots, now_ms()))
            }
            Command::SelectAppointment { id } => {
                let appointment = engine::get_appointment(engine, id)
                    .await
                    .map_err(engine_err)?;
                Ok(appointment_rows(std::slice::from_ref(&appointment), now_ms()))
            }
            Command::SelectMyAppointments {
                now,
                bucket,
                limit,
                offset,
            } => {
                let now = now.unwrap_or_else(now_ms);
                let partition = engine::my_appointments(engine, caller, now)
                    .await
                    .map_err(engine_err)?;
                let tagged: Vec<(Bucket, &Classified)> = match bucket {
                    Some(b) => partition.bucket(b).iter().map(|c| (b, c)).collect(),
                    None => partition
                        .upcoming
                        .iter()
                        .map(|c| (Bucket::Upcoming, c))
                        .chain(partition.past.iter().map(|c| (Bucket::Past, c)))
                        .collect(),
                };
                let limit = limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);

                let schema = Arc::new(my_appointments_schema());
                let rows: Vec<PgWireResult<DataRow>> = tagged
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(b, c)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encode_appointment(&mut encoder, &c.appointment, c.effective.as_str())?;
                        encoder.encode_field(&b.as_str().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn appointment_rows(appointments: &[Appointment], now: Ms) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<DataRow>> = appointments
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            let effective = effective_status(a.status, a.appointment_date, now);
            encode_appointment(&mut encoder, a, effective.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_appointment(
    encoder: &mut DataRowEncoder,
    a: &Appointment,
    effective: &str,
) -> PgWireResult<()> {
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.service_id.to_string())?;
    encoder.encode_field(&a.user_id.map(|u| u.to_string()))?;
    encoder.encode_field(&a.appointment_date)?;
    encoder.encode_field(&i16::from(a.status.ordinal()))?;
    encoder.encode_field(&effective.to_string())?;
    Ok(())
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("service_id"),
        text_field("user_id"),
        FieldInfo::new("appointment_date".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::INT2, FieldFormat::Text),
        text_field("effective_status"),
    ]
}

fn my_appointments_schema() -> Vec<FieldInfo> {
    let mut schema = appointment_schema();
    schema.push(text_field("bucket"));
    schema
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("provider_id"),
        FieldInfo::new("appointment_count".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

/// Row description for a statement, found without binding its parameters.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("MY_APPOINTMENTS") {
        my_appointments_schema()
    } else if upper.contains("APPOINTMENTS") {
        appointment_schema()
    } else if upper.contains("SERVICES") {
        services_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.respond(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.respond(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Inline bound text parameters as quoted literals. Higher indices go first
/// so `$1` never clobbers the prefix of `$10`.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotwiseAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotwiseHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotwiseAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotwiseFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine error. A claim conflict is a serialization
/// failure so drivers surface it as retryable with a fresh slot list.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "40001",
        EngineError::InvalidState { .. } => "55000",
        EngineError::NotFound(_) => "P0002",
        EngineError::Unauthorized(_) => "28000",
        EngineError::AlreadyExists(_) | EngineError::SlotTaken { .. } => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
