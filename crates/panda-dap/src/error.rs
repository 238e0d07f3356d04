use panda_wire::WireError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("invalid arguments for `{command}`: {source}")]
    InvalidArguments {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to connect to debug server: {0}")]
    Launch(#[source] WireError),

    #[error("Failed to attach: {0}")]
    Attach(#[source] WireError),

    #[error("unsupported request `{0}`")]
    Unsupported(String),
}
