//! Error types exposed by this crate.
//!
//! Two layers of failure reporting coexist:
//!
//! - [`Status`] is the closure-visible result of a submitted task: a numeric
//!   code plus an optional message. Code `0` is success. This is what a
//!   client callback ultimately observes.
//! - [`StoreError`] is the typed error returned by the storage engine
//!   adapter; it is converted into a [`Status`] at the closure boundary.
//!
//! A [`RaftException`] is the latched, fatal form: once the apply pipeline
//! records one, the state machine is considered poisoned and further commits
//! become no-ops.

use std::fmt;

use anyerror::AnyError;

/// Classified failure kinds, each with a stable numeric code carried by
/// [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftError {
    /// Unclassified failure.
    Unknown,
    /// Storage or snapshot I/O failed.
    Io,
    /// Invalid argument or state.
    Inval,
    /// Snapshot is older than the current state.
    Stale,
    /// The component is shutting down.
    Shutdown,
    /// The user state machine raised an error; the pipeline is poisoned.
    StateMachine,
    /// A log payload could not be decoded into an operation.
    Decode,
    /// The operation discriminator is not part of the dispatch table.
    IllegalOp,
}

impl RaftError {
    /// The numeric code reported through [`Status`].
    pub const fn code(self) -> i32 {
        match self {
            RaftError::Unknown => -1,
            RaftError::Io => 1000,
            RaftError::Inval => 1001,
            RaftError::Stale => 1002,
            RaftError::Shutdown => 1003,
            RaftError::StateMachine => 1004,
            RaftError::Decode => 1005,
            RaftError::IllegalOp => 1006,
        }
    }
}

/// Result of a completed task as seen by its closure.
///
/// `code == 0` means success; anything else is a failure whose message is
/// meant for humans, not for dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    code: i32,
    message: Option<String>,
}

impl Status {
    /// The success status.
    pub fn ok() -> Self {
        Status::default()
    }

    pub fn new(err: RaftError, message: impl Into<String>) -> Self {
        Status {
            code: err.code(),
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "Status[OK]")
        } else {
            write!(f, "Status[{}: {}]", self.code, self.message())
        }
    }
}

/// Which part of the pipeline a latched error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Log,
    Snapshot,
    StateMachine,
}

/// A fatal error latched by the apply pipeline.
///
/// Cloneable so it can be handed to both the state machine and the node
/// error hook.
#[derive(Debug, Clone)]
pub struct RaftException {
    error_type: ErrorType,
    status: Status,
}

impl RaftException {
    pub fn new(error_type: ErrorType, status: Status) -> Self {
        RaftException { error_type, status }
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    pub fn status(&self) -> &Status {
        &self.status
    }
}

impl fmt::Display for RaftException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaftException[{:?}]: {}", self.error_type, self.status)
    }
}

/// Serialization / deserialization failure.
#[derive(Debug, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub AnyError);

impl CodecError {
    pub fn from_err<E: std::error::Error + 'static>(e: &E) -> Self {
        CodecError(AnyError::new(e))
    }
}

/// Errors raised by the storage engine adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Db(#[from] rocksdb::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("database is not open")]
    NotOpen,

    #[error("iterator invalidated: database version changed from {created} to {current}")]
    IteratorInvalidated { created: u64, current: u64 },

    #[error("missing column family: {0}")]
    MissingColumnFamily(&'static str),

    #[error("{0}")]
    Other(AnyError),
}

impl StoreError {
    /// Map to the closure-visible status.
    pub fn to_status(&self) -> Status {
        match self {
            StoreError::Db(_) | StoreError::Io(_) => Status::new(RaftError::Io, self.to_string()),
            StoreError::Codec(_) => Status::new(RaftError::Decode, self.to_string()),
            StoreError::NotOpen => Status::new(RaftError::Shutdown, self.to_string()),
            _ => Status::new(RaftError::Unknown, self.to_string()),
        }
    }
}
