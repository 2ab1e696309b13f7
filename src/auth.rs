use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CommandError;
use crate::store::UserUid;

/// Outcome of authenticating one request.
#[derive(Debug, Clone)]
pub struct Credential {
    pub authorized: bool,
    pub user_id: String,
    pub user_uid: UserUid,
}

impl Credential {
    pub fn unauthorized() -> Self {
        Credential {
            authorized: false,
            user_id: String::new(),
            user_uid: 0,
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn auth(&self, user_id: &str, password: &str) -> Result<Credential, CommandError>;
}

/// Single-account authenticator for development and tests. A production
/// deployment replaces this with a directory-backed implementation.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticAuthenticator {
    pub username: String,
    pub password: String,
    pub user_uid: UserUid,
}

impl StaticAuthenticator {
    pub fn new(username: &str, password: &str, user_uid: UserUid) -> Self {
        StaticAuthenticator {
            username: username.to_string(),
            password: password.to_string(),
            user_uid,
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn auth(&self, user_id: &str, password: &str) -> Result<Credential, CommandError> {
        if user_id != self.username || password != self.password {
            return Ok(Credential::unauthorized());
        }
        Ok(Credential {
            authorized: true,
            user_id: user_id.to_string(),
            user_uid: self.user_uid,
        })
    }
}
