use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid image id: {0:?}")]
    InvalidImageId(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Fan-out failed for nodes: {}", .0.join(", "))]
    PartialFanout(Vec<String>),
}

pub type Result<T> = std::result::Result<T, SyncError>;
