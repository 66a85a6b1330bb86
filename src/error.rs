//! WolfPage Error Types

use thiserror::Error;

/// Result type alias for WolfPage operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfPage error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // WAL errors
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL segment not found: {0}")]
    WalSegmentNotFound(u64),

    #[error("WAL record corrupted in segment {segment} at offset {offset}: {reason}")]
    WalCorrupted {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("WAL codec error: {0}")]
    Codec(String),

    // Storage errors
    #[error("Page store error: {0}")]
    PageStore(String),

    // Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint batch {batch} ({pages} pages) failed: {reason}")]
    CheckpointFailed {
        pages: usize,
        batch: usize,
        reason: String,
    },

    #[error("Operation interrupted")]
    Interrupted,

    // Metadata errors
    #[error("Schema misuse: {0}")]
    SchemaMisuse(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable on the next checkpoint trigger
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::PageStore(_)
                | Error::Checkpoint(_)
                | Error::CheckpointFailed { .. }
        )
    }

    /// Check if this error indicates state that must not be silently continued from
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SchemaMisuse(_) | Error::WalCorrupted { .. } | Error::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_fatal());

        let misuse = Error::SchemaMisuse("field already exists".into());
        assert!(misuse.is_fatal());
        assert!(!misuse.is_retryable());

        assert!(!Error::Interrupted.is_retryable());
    }

    #[test]
    fn test_checkpoint_failure_message_has_context() {
        let err = Error::CheckpointFailed {
            pages: 128,
            batch: 3,
            reason: "short write".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 3"));
        assert!(msg.contains("128 pages"));
    }
}
