use thiserror::Error;
use uuid::Uuid;

/// Why a remote document version was refused. A refused version never
/// changes local state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Declared ID {declared} does not match known ID {expected}")]
    IdMismatch { expected: Uuid, declared: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp in {field}: {value}")]
    BadTimestamp { field: &'static str, value: String },

    #[error("Locator in {field} ({incoming}) does not match known locator {existing}")]
    LocatorMismatch {
        field: &'static str,
        existing: String,
        incoming: String,
    },

    #[error("Invalid locator in {field}: {value}")]
    BadLocator { field: &'static str, value: String },

    #[error("Invalid entry in {section}: {reason}")]
    BadSubEntity { section: &'static str, reason: String },
}

/// Failure reported by the fetch, publish or watch capabilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Rejected by network: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Document {0} is not locally owned")]
    NotLocal(Uuid),

    #[error("Document {0} has no public locator")]
    NoLocator(Uuid),
}
