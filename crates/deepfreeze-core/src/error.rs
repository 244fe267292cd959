//! Error types for the backup pipeline.

use thiserror::Error;

/// Result type alias for backup operations.
pub type FreezeResult<T> = Result<T, FreezeError>;

/// Error variants for backup operations.
#[derive(Debug, Error)]
pub enum FreezeError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A descriptor record failed to encode or decode.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation was attempted against a stream opened in the other
    /// direction, or against a stream that was already closed.
    #[error("cannot {attempted} a {mode} archive stream")]
    Direction {
        /// The operation that was attempted.
        attempted: &'static str,
        /// The mode the stream is actually in.
        mode: &'static str,
    },

    /// A metadata record did not carry the expected name.
    #[error("unexpected metadata record: expected {expected:?}, found {found:?}")]
    FormatMismatch {
        /// The record name that was expected.
        expected: String,
        /// The record name that was found.
        found: String,
    },

    /// A molecule's header records do not fit in an empty cube.
    #[error("cube capacity {max_size} bytes cannot hold {required} bytes of molecule records")]
    CapacityExhausted {
        /// The configured cube capacity in bytes.
        max_size: u64,
        /// The bytes required before any file content can be written.
        required: u64,
    },

    /// Keyring load, key generation, encryption, or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Indexing was aborted via the shared done signal.
    #[error("indexing cancelled")]
    Cancelled,
}
