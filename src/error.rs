use thiserror::Error;

use crate::store::StoreError;

/// Error taxonomy for a single command execution. `BadRequest` produces an
/// HTTP 400, everything else a 500; `Store(Deadlock)` is the only variant
/// the dispatch loop retries.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, CommandError::Store(StoreError::Deadlock))
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, CommandError::BadRequest(_))
    }
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("empty recipient list")]
    EmptyRecipients,
    #[error("empty message body")]
    EmptyMessage,
    #[error("SMTP error: {0}")]
    Smtp(String),
}

impl From<MailerError> for CommandError {
    fn from(err: MailerError) -> Self {
        CommandError::Internal(format!("failed to submit mail: {err}"))
    }
}
