use std::io;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid gateway configuration: {0}")]
    Configuration(String),

    #[error("network stack error: {0}")]
    Stack(String),

    #[error("connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
