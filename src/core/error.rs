use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid ID length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unable to decode ID: {0}")]
    UnknownMapping(String),

    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    #[error("No active shard available")]
    NoActiveShardAvailable,

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;

impl<T> From<std::sync::PoisonError<T>> for ShardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Execution(format!("lock poisoned: {err}"))
    }
}
