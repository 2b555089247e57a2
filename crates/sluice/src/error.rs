//! Error types for the runtime
//!
//! One top-level [`SluiceError`] plus focused sub-enums for storage and
//! table operations. Aggregation favors partial success: one misbehaving
//! key never poisons a whole result map. Configuration problems surface
//! eagerly and abort startup.

use std::sync::Arc;

use thiserror::Error;

use crate::core::ResultMap;

/// Main runtime error type.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Storage resource errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Table errors
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Value codec errors
    #[error("codec error: {0}")]
    Codec(String),

    /// A record value did not have the shape a processor expected
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Two aggregator instances are not compatible to be merged
    #[error("processors not compatible to be merged")]
    NotMergeable,

    /// Finalize deadline passed
    #[error("finalize deadline exceeded")]
    DeadlineExceeded,

    /// A previously cached error, replayed for a poisoned table key
    #[error(transparent)]
    Cached(Arc<SluiceError>),

    /// Item factory failure
    #[error("item factory failed for key '{key}': {reason}")]
    Factory { key: String, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Resource specification and adapter lookup errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource path does not match `format:[/media]path[@shards]`
    #[error("malformed resource path: '{path}'")]
    MalformedPath { path: String },

    /// Format name not present in the format registry
    #[error("unknown storage format: '{name}'")]
    UnknownFormat { name: String },

    /// Media name not present in the media registry
    #[error("unknown storage media: '{name}'")]
    UnknownMedia { name: String },

    /// A format or media was registered under an already taken name
    #[error("duplicate storage registration: '{name}'")]
    DuplicateName { name: String },

    /// The format cannot be implemented on the requested media
    #[error("storage feature not supported: {reason}")]
    NotSupported { reason: String },
}

/// Table configuration and lifecycle errors.
#[derive(Error, Debug)]
pub enum TableError {
    /// Spec is missing a required option for the requested table kind
    #[error("invalid table spec for '{name}': {reason}")]
    InvalidSpec { name: String, reason: String },

    /// Finalize produced results for some keys but not all; the partial
    /// map is preserved alongside one representative error
    #[error("finalize completed partially: {source}")]
    Partial {
        result: ResultMap,
        #[source]
        source: Box<SluiceError>,
    },

    /// Inspection stopped at a callback error after visiting `visited` items
    #[error("inspection aborted after {visited} items: {source}")]
    Inspect {
        visited: usize,
        #[source]
        source: Box<SluiceError>,
    },

    /// Feed after finalize
    #[error("table '{name}' is closed")]
    Closed { name: String },
}

impl SluiceError {
    /// Wrap an error for caching in a poison map; replays share one
    /// underlying allocation so callers can compare identity.
    pub fn into_cached(self) -> Arc<SluiceError> {
        match self {
            SluiceError::Cached(inner) => inner,
            other => Arc::new(other),
        }
    }
}

impl From<Arc<SluiceError>> for SluiceError {
    fn from(err: Arc<SluiceError>) -> Self {
        SluiceError::Cached(err)
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::Codec(err.to_string())
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
