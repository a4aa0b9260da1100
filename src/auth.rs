use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_ACCOUNT_LEN;

/// Shared-password login. The user name is the caller's account, so it has
/// to be usable as one before the password is even checked.
#[derive(Debug)]
pub struct LedgerAuthSource {
    password: String,
}

impl LedgerAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// Whether `user` can act as an account.
pub fn check_user(user: &str) -> Result<(), &'static str> {
    if user.is_empty() {
        return Err("a user name is required");
    }
    if user.len() > MAX_ACCOUNT_LEN {
        return Err("user name too long");
    }
    Ok(())
}

#[async_trait]
impl AuthSource for LedgerAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(msg) = check_user(login.user().as_deref().unwrap_or("")) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                msg.into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
