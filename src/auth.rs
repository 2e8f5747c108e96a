use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared cleartext password for every client login.
#[derive(Debug)]
pub struct DuetAuthSource {
    password: Vec<u8>,
}

impl DuetAuthSource {
    pub fn new(password: String) -> Self {
        Self { password: password.into_bytes() }
    }
}

#[async_trait]
impl AuthSource for DuetAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password check for user {:?}", login.user());
        Ok(Password::new(None, self.password.clone()))
    }
}
