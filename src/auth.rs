use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Shared-password auth. The login name is not checked here; it becomes the
/// caller's identity and is parsed when a statement needs it.
#[derive(Debug)]
pub struct CineseatAuthSource {
    password: String,
}

impl CineseatAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CineseatAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = login.user().unwrap_or("<none>"), "password auth");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
