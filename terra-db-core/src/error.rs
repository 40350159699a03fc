//! Error types for terra-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error taxonomy shared by every Terra crate.
///
/// Per-instruction failures (`ConcurrencyConflict`, feature-level `NotFound`,
/// `IllegalState` on a create conflict) are reported in the failing
/// instruction's slot of a write result. `Fatal` and `Driver` abort the whole
/// batch.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// An invariant was violated
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Map, collection or feature not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage identity conflict during initialization
    #[error("Storage identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch { expected: String, found: String },

    /// The same target was addressed twice within one write batch
    #[error("Feature '{feature_id}' targeted more than once in collection '{collection}'")]
    UniqueConflict {
        collection: String,
        feature_id: String,
    },

    /// Expected Guid does not match the current state
    #[error(
        "Concurrency conflict on '{feature_id}' in '{collection}': expected {expected}, actual {}",
        actual.as_deref().unwrap_or("<none>")
    )]
    ConcurrencyConflict {
        collection: String,
        feature_id: String,
        expected: String,
        actual: Option<String>,
    },

    /// Batch execution reported a driver-level failure
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Requested combination is not implemented
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Transport-level failure reported by the driver
    #[error("Driver error: {0}")]
    Driver(String),

    /// Payload, geometry or address encoding failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an illegal argument error
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Error::IllegalArgument(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create a driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        Error::Driver(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Whether this error aborts a whole write batch rather than one instruction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::Driver(_))
    }

    /// Whether this error is an optimistic-concurrency failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}
