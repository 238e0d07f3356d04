use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Not connected")]
    NotConnected,

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    /// A newer connect or an explicit stop superseded this operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WireError::Cancelled)
    }
}
