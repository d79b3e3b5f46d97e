use thiserror::Error;

/// Errors surfaced at the crate boundary.
///
/// Group capacity exhaustion is deliberately not represented here: a full
/// group is rotated out by the registry and the batch spills to the next
/// writable group, so callers never observe it.
#[derive(Debug, Error)]
pub enum Error {
    /// A hash is missing from a group index, or from every retrieval
    /// candidate.
    #[error("block not found: {0}")]
    NotFound(String),

    /// On-disk framing is broken, an index disagrees with the log, or a
    /// remote returned bytes that do not hash to the requested key.
    #[error("corrupt data: {0}")]
    Corruption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Metadata store failure.
    #[error("metadata store: {0}")]
    Db(String),

    /// An operation was invoked on a group in a state that does not allow
    /// it. Indicates a caller bug; not retried.
    #[error("illegal group state: {0}")]
    State(String),

    /// Serialization failure while building index nodes.
    #[error("encoding: {0}")]
    Encoding(String),

    /// The fetch this caller was coalesced onto was cancelled. Propagated
    /// as-is, never retried against another source.
    #[error("operation cancelled")]
    Cancelled,

    /// Remote fetch failure after all candidates were exhausted.
    #[error("retrieval: {0}")]
    Retrieval(String),
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! from_redb {
    ($($err:ty),+ $(,)?) => {
        $(impl From<$err> for Error {
            fn from(e: $err) -> Self {
                Error::Db(e.to_string())
            }
        })+
    };
}

from_redb!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
