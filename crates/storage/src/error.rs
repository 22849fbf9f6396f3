use quiver_types::LogicalType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Storage-level error kinds.
///
/// Row-level errors (`DuplicatePk`, `NullPk`, `OutOfRange`, `TypeMismatch`)
/// abort the current statement but leave the transaction usable. The rest
/// abort the transaction; [`Error::is_fatal`] additionally marks the database
/// read-only until restart.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "found duplicated primary key value {key}, which violates the uniqueness constraint of the primary key column"
    )]
    DuplicatePk { key: String },

    #[error("null value cannot be used as a primary key")]
    NullPk,

    #[error("{what} index {index} is out of range (size {len})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        len: u64,
    },

    #[error("value {value} does not match column type {expected}")]
    TypeMismatch {
        expected: LogicalType,
        value: String,
    },

    #[error("data corruption: {0}")]
    Corruption(String),

    /// Internal: the caller rolls over to a new segment and retries.
    #[error("column chunk is full")]
    ChunkFull,

    #[error("shadow file cannot be reconciled: {0}")]
    ShadowFileRecovery(String),

    #[error("wal: {0}")]
    Wal(#[from] quiver_wal::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors mark the database read-only until restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_)
                | Error::ShadowFileRecovery(_)
                | Error::Wal(_)
                | Error::InvariantViolation(_)
                | Error::Io(_)
        )
    }
}

impl From<quiver_types::buffer::DecodeError> for Error {
    fn from(e: quiver_types::buffer::DecodeError) -> Self {
        Error::Corruption(e.to_string())
    }
}
