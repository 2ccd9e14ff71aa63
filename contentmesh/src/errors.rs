use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;
use std::sync::Arc;

/// Error kinds for content mesh operations.
///
/// Each kind describes one category of failure so that callers can decide
/// whether to retry, report or ignore an error without parsing messages.
///
/// # Examples
///
/// ```rust
/// use contentmesh::errors::{ErrorKind, MeshError, MeshResult};
///
/// fn example() -> MeshResult<()> {
///     Err(MeshError::new("Schema container not found", ErrorKind::NotFound))
/// }
/// assert!(example().is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // Schema version chain errors
    /// Another schema update was committed for the same container since this
    /// update read the version chain. The caller must retry the whole update.
    ConcurrentSchemaUpdate,
    /// One or more content units failed to migrate. Carries the failed unit ids.
    MigrationIncomplete(Vec<String>),
    /// A single content unit failed its transform
    MigrationError,
    /// A field value cannot be converted between two field types
    TypeConversionError,

    // Search synchronization errors
    /// A fully specified index context matched no field container
    UnknownIndexTarget,
    /// A store or delete obligation failed after all retries
    SyncObligationFailure,
    /// The search backend reported an error
    SearchBackendError,

    // Validation errors
    /// Generic validation error
    ValidationError,
    /// Invalid field name in a schema definition
    InvalidFieldName,

    // Lookup and operation errors
    /// The requested element was not found
    NotFound,
    /// The operation is not valid in the current state
    InvalidOperation,
    /// A storage transaction lost an optimistic-conflict check
    TransactionConflict,
    /// The operation was cancelled before it committed
    Cancelled,
    /// The operation exceeded its time budget
    Timeout,

    // IO and encoding errors
    /// Error encoding or decoding data
    EncodingError,
    /// Generic IO error
    IOError,

    // Event errors
    /// Error in event processing
    EventError,

    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConcurrentSchemaUpdate => write!(f, "Concurrent schema update"),
            ErrorKind::MigrationIncomplete(units) => {
                write!(f, "Migration incomplete ({} failed units)", units.len())
            }
            ErrorKind::MigrationError => write!(f, "Migration error"),
            ErrorKind::TypeConversionError => write!(f, "Type conversion error"),
            ErrorKind::UnknownIndexTarget => write!(f, "Unknown index target"),
            ErrorKind::SyncObligationFailure => write!(f, "Sync obligation failure"),
            ErrorKind::SearchBackendError => write!(f, "Search backend error"),
            ErrorKind::ValidationError => write!(f, "Validation error"),
            ErrorKind::InvalidFieldName => write!(f, "Invalid field name"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::TransactionConflict => write!(f, "Transaction conflict"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::EncodingError => write!(f, "Encoding error"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::EventError => write!(f, "Event error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Error type of the content mesh.
///
/// `MeshError` carries a message, an [ErrorKind] and an optional cause. It
/// captures an unresolved backtrace at construction time, which is resolved
/// lazily only when the error is debug-printed.
///
/// # Examples
///
/// ```rust
/// use contentmesh::errors::{ErrorKind, MeshError};
///
/// let cause = MeshError::new("connection reset", ErrorKind::IOError);
/// let err = MeshError::new_with_cause("upsert failed", ErrorKind::SearchBackendError, cause);
/// assert_eq!(err.kind(), &ErrorKind::SearchBackendError);
/// assert!(err.cause().is_some());
/// ```
#[derive(Clone)]
pub struct MeshError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<MeshError>>,
    backtrace: Arc<Backtrace>,
}

impl MeshError {
    /// Creates a new `MeshError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        MeshError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: Arc::new(Backtrace::new_unresolved()),
        }
    }

    /// Creates a new `MeshError` chained to the error that caused it.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: MeshError) -> Self {
        MeshError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: Arc::new(Backtrace::new_unresolved()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&MeshError> {
        self.cause.as_deref()
    }

    /// Returns the failed unit ids when this is a `MigrationIncomplete` error,
    /// an empty slice otherwise.
    pub fn failed_units(&self) -> &[String] {
        match &self.error_kind {
            ErrorKind::MigrationIncomplete(units) => units,
            _ => &[],
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::SearchBackendError
                | ErrorKind::Timeout
                | ErrorKind::IOError
                | ErrorKind::TransactionConflict
        )
    }
}

impl Display for MeshError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for MeshError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut backtrace = (*self.backtrace).clone();
        backtrace.resolve();
        write!(f, "{}: {}", self.error_kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, "\nCaused by: {:?}", cause)?;
        }
        write!(f, "\n{:?}", backtrace)
    }
}

impl Error for MeshError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn Error + 'static))
    }
}

/// Result type used throughout the content mesh.
///
/// # Examples
///
/// ```rust
/// use contentmesh::errors::{ErrorKind, MeshError, MeshResult};
///
/// fn find_release(name: &str) -> MeshResult<String> {
///     if name.is_empty() {
///         return Err(MeshError::new("Release name is empty", ErrorKind::ValidationError));
///     }
///     Ok(name.to_string())
/// }
/// assert!(find_release("").is_err());
/// ```
pub type MeshResult<T> = Result<T, MeshError>;

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::new(&format!("IO error: {}", err), ErrorKind::IOError)
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::new(&format!("JSON error: {}", err), ErrorKind::EncodingError)
    }
}

impl From<uuid::Error> for MeshError {
    fn from(err: uuid::Error) -> Self {
        MeshError::new(&format!("Invalid uuid: {}", err), ErrorKind::ValidationError)
    }
}

impl From<String> for MeshError {
    fn from(msg: String) -> Self {
        MeshError::new(&msg, ErrorKind::InternalError)
    }
}

impl From<&str> for MeshError {
    fn from(msg: &str) -> Self {
        MeshError::new(msg, ErrorKind::InternalError)
    }
}
