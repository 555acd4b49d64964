use std::fmt::Display;

/// Errors surfaced by the monitor core. None of these are fatal to the
/// process; callers log them and keep the session running.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("invalid input: {0}")]
    Validation(String),
}

impl MonitorError {
    pub fn transport(err: impl Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }
}
