//! Error types for ruletun

use thiserror::Error;

/// Main error type for ruletun
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("Dial error: {0}")]
    Dial(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown outbound: {0}")]
    UnknownOutbound(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Result type alias for ruletun
pub type Result<T> = std::result::Result<T, Error>;
