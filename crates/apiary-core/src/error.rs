//! Error kinds shared across the hub.
//!
//! Every manager operation returns [`HubError`]. The variants map onto the
//! failure classes the MCP layer reports in-band, so `kind()` strings are
//! part of the tool-call wire surface.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = HubError> = std::result::Result<T, E>;

/// Failure classes for hub operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// The referenced aggregate does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint would be violated (e.g. duplicate agent name).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The caller supplied an invalid value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The aggregate is in the wrong state for the requested transition.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The resource is held by another owner (e.g. a port leased elsewhere).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An external collaborator (container runtime, git) is unreachable or
    /// reported a failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A bug: an invariant the hub maintains was observed broken.
    #[error("internal: {0}")]
    Internal(String),
}

impl HubError {
    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error returned when parsing an invalid enum literal from the wire.
#[derive(Debug, Clone, Error)]
#[error("invalid {what}: {value:?}")]
pub struct InvalidEnumValue {
    /// What was being parsed (e.g. "task status").
    pub what: &'static str,
    /// The offending input.
    pub value: String,
}

impl InvalidEnumValue {
    pub fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}

impl From<InvalidEnumValue> for HubError {
    fn from(e: InvalidEnumValue) -> Self {
        HubError::InvalidArgument(e.to_string())
    }
}
