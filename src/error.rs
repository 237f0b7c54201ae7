use thiserror::Error;

/// Result alias used by every fallible shard operation.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Errors reported by shard builders and readers.
///
/// A lookup that finds nothing is not an error: [`Shard::find`](crate::Shard::find)
/// and friends return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("key is already staged in this shard")]
    DuplicateKey,

    #[error("key is not staged in this shard")]
    KeyNotFound,

    #[error("shard capacity of {capacity} objects exceeded")]
    CapacityExceeded { capacity: u64 },

    #[error("shard was prepared for {expected} objects but {actual} were written")]
    CountMismatch { expected: u64, actual: u64 },

    #[error("perfect hash construction failed: {0}")]
    HashConstruction(String),

    #[error("cannot {operation} while shard is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("corrupt shard file: {0}")]
    Corrupt(String),

    #[error("range {offset}+{size} exceeds section size {limit}")]
    OutOfRange { offset: u64, size: u64, limit: u64 },

    #[error("invalid shard options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShardError {
    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        ShardError::Corrupt(message.into())
    }
}
