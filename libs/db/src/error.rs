//! Error kinds surfaced by the storage core.
//!
//! Every failure that can cross the HTTP boundary is a distinct variant so
//! the server can map kinds to status codes in one place. Engine-level
//! failures (`Io`) abort the request with no rollback attempted.

use thiserror::Error;

use crate::Uuid;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No version node matches the given UUID prefix.
    #[error("no version node matches UUID prefix {0:?}")]
    UnknownUuid(String),

    /// The UUID prefix matches more than one version node.
    #[error("UUID prefix {prefix:?} matches {matches} version nodes; use more characters")]
    AmbiguousUuid { prefix: String, matches: usize },

    /// No data type with this name is compiled in.
    #[error("data type {0:?} is not available on this server")]
    UnknownType(String),

    /// The repo has no data instance with this name.
    #[error("no data instance named {0:?}")]
    UnknownData(String),

    /// A data instance with this name already exists somewhere in the repo.
    #[error("data instance name {0:?} already exists in this repo")]
    DuplicateName(String),

    /// The version node is locked; its data is immutable.
    #[error("version node {0} is locked and cannot be modified")]
    VersionLocked(Uuid),

    /// The version node must be locked before this operation (branching).
    #[error("version node {0} must be locked before creating child versions")]
    NotLocked(Uuid),

    /// A request body failed to parse or violated the wire format.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// A stored key did not match the context that read it.
    #[error("malformed storage key: {0}")]
    MalformedKey(String),

    /// The startup configuration is invalid.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// A request was syntactically valid but not usable (wrong verb, bad
    /// query parameter, unknown endpoint).
    #[error("{0}")]
    BadRequest(String),

    /// The bound store cannot batch writes, which this operation requires.
    #[error("store {0:?} does not support batch writes")]
    BatcherUnsupported(String),

    /// The configured engine does not return keys in ascending byte order.
    #[error("engine {0:?} is not an ordered key-value store")]
    EngineNotOrdered(String),

    /// The request was cancelled; partially applied writes are not rolled
    /// back.
    #[error("request cancelled")]
    Cancelled,

    /// The server only accepts GET and HEAD requests.
    #[error("server is in read-only mode and only accepts GET and HEAD requests")]
    ReadOnly,

    /// Underlying key-value engine failure.
    #[error("storage engine error: {0}")]
    Io(#[from] rocksdb::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedJson(err.to_string())
    }
}

impl Error {
    /// Stable machine-readable name for this kind, carried in HTTP error
    /// bodies so clients can distinguish e.g. read-only refusals.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownUuid(_) => "UnknownUuid",
            Error::AmbiguousUuid { .. } => "AmbiguousUuid",
            Error::UnknownType(_) => "UnknownType",
            Error::UnknownData(_) => "UnknownData",
            Error::DuplicateName(_) => "DuplicateName",
            Error::VersionLocked(_) => "VersionLocked",
            Error::NotLocked(_) => "NotLocked",
            Error::MalformedJson(_) => "MalformedJson",
            Error::MalformedKey(_) => "MalformedKey",
            Error::BadConfig(_) => "BadConfig",
            Error::BadRequest(_) => "BadRequest",
            Error::BatcherUnsupported(_) => "BatcherUnsupported",
            Error::EngineNotOrdered(_) => "EngineNotOrdered",
            Error::Cancelled => "Cancelled",
            Error::ReadOnly => "ReadOnly",
            Error::Io(_) => "Io",
        }
    }
}
