//! Error types for client sessions.

use thiserror::Error;
use tokio::task::JoinError;

/// Errors returned when joining a session task.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session task panicked.
    #[error("session task panicked: {0}")]
    Panicked(String),
    /// The session task was aborted by the runtime.
    #[error("session task aborted")]
    Aborted,
}

impl From<JoinError> for SessionError {
    fn from(err: JoinError) -> Self {
        match err.try_into_panic() {
            Ok(panic) => Self::Panicked(crate::panic::format_panic(&*panic).to_string()),
            Err(_) => Self::Aborted,
        }
    }
}
