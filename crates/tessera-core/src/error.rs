//! Error types for tessera
//!
//! Every backend operation returns [`Error`]. Callers branch on
//! [`Error::kind`] rather than on variants so that backends are free to attach
//! their own diagnostic context:
//! - Precondition failures (already exists, not found, compare failed)
//! - Input validation (bad parameter)
//! - Transient storage failures (connection, serialization conflicts, timeouts)
//! - Watcher lifecycle (overflow, closed)

use std::fmt;
use thiserror::Error;

/// Result type for tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error source preserved for diagnostics
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// SQLSTATEs of transactions that lost a conflict and can be rerun as-is:
/// serialization_failure, deadlock_detected, unique_violation and
/// exclusion_violation (concurrent inserts under serializable isolation)
pub const CONFLICT_CODES: [&str; 4] = ["40001", "40P01", "23505", "23P01"];

/// Stable error classification for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A live item already exists at the key
    AlreadyExists,
    /// No live item exists at the key
    NotFound,
    /// A compare-and-swap precondition did not hold
    CompareFailed,
    /// Malformed input or configuration
    BadParameter,
    /// The store could not be reached
    Connection,
    /// The store rejected or failed a statement
    Storage,
    /// An operation or acquisition timed out
    Timeout,
    /// Retries were exhausted on a transient failure
    LimitExceeded,
    /// The operation was canceled
    Canceled,
    /// A watcher fell behind or was closed and must resynchronize
    Watcher,
    /// The backend or buffer has been closed
    Closed,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::NotFound => write!(f, "not_found"),
            Self::CompareFailed => write!(f, "compare_failed"),
            Self::BadParameter => write!(f, "bad_parameter"),
            Self::Connection => write!(f, "connection"),
            Self::Storage => write!(f, "storage"),
            Self::Timeout => write!(f, "timeout"),
            Self::LimitExceeded => write!(f, "limit_exceeded"),
            Self::Canceled => write!(f, "canceled"),
            Self::Watcher => write!(f, "watcher"),
            Self::Closed => write!(f, "closed"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for tessera
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Create on a live key
    #[error("already exists: {message}")]
    AlreadyExists { message: String },

    /// Read or conditional write on a key without a live row
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Compare-and-swap precondition mismatch
    #[error("compare failed: {message}")]
    CompareFailed { message: String },

    /// Malformed input or invalid configuration
    #[error("bad parameter: {message}")]
    BadParameter { message: String },

    /// Failure reaching the store; nothing was sent to the server
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Failure reported by, or while talking to, the store
    #[error("storage error: {message}")]
    Storage {
        message: String,
        /// SQLSTATE (or equivalent) when the server produced the error
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Transient failures persisted past the retry budget
    #[error("too many retries ({attempts} attempts), last error: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The operation was canceled before it completed
    #[error("operation canceled")]
    Canceled,

    /// The watcher fell behind the buffer and must resynchronize
    #[error("watcher {name:?} fell behind by {skipped} events, resync required")]
    WatcherOverflow { name: String, skipped: u64 },

    /// The watcher was closed by the buffer and must resynchronize
    #[error("watcher {name:?} closed, resync required")]
    WatcherClosed { name: String },

    /// The backend or buffer has been closed
    #[error("closed: {message}")]
    Closed { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CompareFailed { .. } => ErrorKind::CompareFailed,
            Self::BadParameter { .. } => ErrorKind::BadParameter,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetriesExhausted { .. } => ErrorKind::LimitExceeded,
            Self::Canceled => ErrorKind::Canceled,
            Self::WatcherOverflow { .. } | Self::WatcherClosed { .. } => ErrorKind::Watcher,
            Self::Closed { .. } => ErrorKind::Closed,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the operation can be rerun no matter what it did
    ///
    /// True when nothing reached the server or when the server rolled the
    /// transaction back on a conflict. A storage error without a code is not
    /// retriable here: it may have committed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. }) || self.is_conflict()
    }

    /// Whether the server rolled the transaction back on a conflict
    pub fn is_conflict(&self) -> bool {
        self.code().is_some_and(|code| CONFLICT_CODES.contains(&code))
    }

    /// Whether this error reports a missing live item
    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether this error reports an existing live item
    #[inline]
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Whether this error reports a failed compare-and-swap
    #[inline]
    pub fn is_compare_failed(&self) -> bool {
        self.kind() == ErrorKind::CompareFailed
    }

    /// Whether this error reports invalid input
    #[inline]
    pub fn is_bad_parameter(&self) -> bool {
        self.kind() == ErrorKind::BadParameter
    }

    /// SQLSTATE of a storage error, if the server produced one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Storage { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Create an already-exists error
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a compare-failed error
    pub fn compare_failed(message: impl Into<String>) -> Self {
        Self::CompareFailed {
            message: message.into(),
        }
    }

    /// Create a bad-parameter error
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error without a server code
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            code: None,
            source: None,
        }
    }

    /// Create a storage error carrying the server code and source
    pub fn storage_with_code(
        message: impl Into<String>,
        code: Option<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            code,
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a closed error
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
