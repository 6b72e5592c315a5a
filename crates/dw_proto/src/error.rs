use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("Unknown frame type: {0}")]
    UnknownFrame(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
