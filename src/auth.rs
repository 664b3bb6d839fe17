use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

/// Shared-password authentication. Every login uses the configured password;
/// who the caller *is* comes from the login name, see [`caller_identity`].
#[derive(Debug)]
pub struct SlotwiseAuthSource {
    password: String,
}

impl SlotwiseAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotwiseAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Resolve the acting user or provider from a login name.
///
/// Only a login that parses as a ULID identifies a caller. Anything else
/// (an operator account, `postgres`) may connect and read slot lists, but
/// every operation that needs an identity rejects it.
pub fn caller_identity(login: Option<&str>) -> Option<Ulid> {
    login.and_then(|name| Ulid::from_string(name.trim()).ok())
}
