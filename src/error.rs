//! Error types for Netchain

use thiserror::Error;

/// Main error type for Netchain
///
/// Structurally impossible events (a mis-wired chain) are not represented
/// here; they terminate the process through `tunnel::contract_violation`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    #[error("Worker {0} is no longer accepting messages")]
    WorkerGone(usize),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias for Netchain
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Config("bad node".into()).to_string(),
            "Configuration error: bad node"
        );
        assert_eq!(
            Error::WorkerGone(3).to_string(),
            "Worker 3 is no longer accepting messages"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
