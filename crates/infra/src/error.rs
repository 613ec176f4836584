//! Errors surfaced by the executors and the drain.

use thiserror::Error;

use civitas_auth::AuthzError;
use civitas_core::DomainError;

use crate::datastore::StoreError;

/// Failure of a command or query, as seen by its caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Malformed input or output; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Rejected by the guard chain before any write.
    #[error(transparent)]
    Authorization(#[from] AuthzError),

    /// Business rule violated inside the body; the transaction rolled back.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Lost a race with a concurrent writer; the transaction rolled back.
    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Infrastructure failure. The core does not retry; the caller decides.
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl OperationError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OperationError::Transient(_) | OperationError::Conflict(_))
    }
}

impl From<DomainError> for OperationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => OperationError::Validation(msg),
            DomainError::InvalidState(msg) => OperationError::InvalidState(msg),
            DomainError::NotFound(msg) => OperationError::NotFound(msg),
            DomainError::Conflict(msg) => OperationError::Conflict(msg),
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::UniqueViolation { table, key } => {
                OperationError::Conflict(format!("{table}/{key} already exists"))
            }
            StoreError::Conflict(what) => OperationError::Conflict(what),
            other => OperationError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperationError {
    fn from(value: serde_json::Error) -> Self {
        OperationError::Validation(value.to_string())
    }
}

/// Failure of a policy handler. The record stays unprocessed for that policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to decode {event}: {source}")]
    Decode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A command invoked by the policy failed.
    #[error("command failed: {0}")]
    Command(#[from] OperationError),

    /// An outbound dependency (RPC node, provider) failed.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

/// Failure of the drain machinery itself (not of a handler).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    #[error("consumer already registered: {0}")]
    DuplicateConsumer(String),

    #[error("{0} is not a projection")]
    NotAProjection(String),

    #[error("consumer lock poisoned: {0}")]
    Poisoned(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violations_surface_as_conflicts() {
        let err: OperationError = StoreError::UniqueViolation {
            table: "memberships".into(),
            key: "a/b".into(),
        }
        .into();
        assert_eq!(err, OperationError::Conflict("memberships/a/b already exists".into()));
        assert!(err.is_transient());
    }

    #[test]
    fn unavailable_store_is_transient() {
        let err: OperationError = StoreError::Unavailable("pool closed".into()).into();
        assert!(matches!(err, OperationError::Transient(_)));
    }

    #[test]
    fn domain_errors_keep_their_category() {
        assert_eq!(
            OperationError::from(DomainError::validation("bad")),
            OperationError::Validation("bad".into())
        );
        assert_eq!(
            OperationError::from(DomainError::invalid_state("closed")),
            OperationError::InvalidState("closed".into())
        );
    }
}
