//! Error types for the container factory.

use std::time::Duration;

use thiserror::Error;
use yarnpool_reconcile::ReconcileError;

use crate::actors::ActorError;
use crate::orchestrator::ServiceLifecycle;

/// A failed call to the resource manager.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection, TLS, or timeout failure before a response arrived.
    #[error("{operation}: transport error: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The resource manager answered with a non-success status.
    #[error("{operation}: rejected with status {status}: {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// A success response whose body could not be decoded.
    #[error("{operation}: malformed response: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },

    /// The request could not be built (bad credentials, bad URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    /// True if retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport { .. } => true,
            RemoteError::Rejected { status, .. } => *status >= 500,
            RemoteError::Malformed { .. } | RemoteError::InvalidRequest(_) => false,
        }
    }
}

/// Errors surfaced by the orchestrator and the factory façade.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The remote state did not converge in time. The mutation was not rolled
    /// back and may still complete.
    #[error("timed out after {elapsed:?} waiting for {resource} to converge")]
    ConvergenceTimeout { resource: String, elapsed: Duration },

    /// A mutation was accepted but the status read that should confirm it
    /// failed. The mutation may still complete.
    #[error("could not confirm {resource}: {source}")]
    Unconfirmed {
        resource: String,
        #[source]
        source: RemoteError,
    },

    /// The remote service entered a terminal failed state while we waited.
    #[error("{resource} entered a failed state")]
    Diverged { resource: String },

    /// Rejected locally before any remote call was made.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("cannot {operation} while the service is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServiceLifecycle,
    },

    #[error("invalid image reference: {0}")]
    InvalidImage(String),

    /// The orchestrator task is no longer running.
    #[error("orchestrator stopped")]
    OrchestratorStopped,
}

impl FactoryError {
    /// True when the remote outcome is unknown: the caller should verify the
    /// service's status before assuming success or failure.
    pub fn is_indeterminate(&self) -> bool {
        match self {
            FactoryError::ConvergenceTimeout { .. } | FactoryError::Unconfirmed { .. } => true,
            FactoryError::Remote(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ReconcileError<RemoteError>> for FactoryError {
    fn from(err: ReconcileError<RemoteError>) -> Self {
        match err {
            ReconcileError::Timeout { resource, elapsed } => {
                FactoryError::ConvergenceTimeout { resource, elapsed }
            }
            ReconcileError::Diverged { resource, .. } => FactoryError::Diverged { resource },
            ReconcileError::Read {
                resource, source, ..
            } => FactoryError::Unconfirmed { resource, source },
        }
    }
}

impl From<ActorError> for FactoryError {
    fn from(_: ActorError) -> Self {
        FactoryError::OrchestratorStopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let server = RemoteError::Rejected {
            operation: "get_service",
            status: 503,
            body: String::new(),
        };
        let client = RemoteError::Rejected {
            operation: "flex_component",
            status: 400,
            body: "bad count".to_string(),
        };

        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(client.to_string().contains("bad count"));
    }

    #[test]
    fn test_timeout_is_indeterminate() {
        let err: FactoryError = ReconcileError::<RemoteError>::Timeout {
            resource: "svc/web".to_string(),
            elapsed: Duration::from_secs(3),
        }
        .into();

        assert!(err.is_indeterminate());
        assert!(matches!(err, FactoryError::ConvergenceTimeout { .. }));
    }

    #[test]
    fn test_failed_confirmation_is_indeterminate() {
        let err: FactoryError = ReconcileError::Read {
            resource: "svc/web".to_string(),
            attempts: 1,
            source: RemoteError::Malformed {
                operation: "get_service",
                message: "expected value".to_string(),
            },
        }
        .into();

        assert!(err.is_indeterminate());
        assert!(matches!(
            err,
            FactoryError::Unconfirmed {
                source: RemoteError::Malformed { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_server_error_is_indeterminate() {
        let err = FactoryError::Remote(RemoteError::Rejected {
            operation: "flex_component",
            status: 503,
            body: String::new(),
        });
        assert!(err.is_indeterminate());
    }

    #[test]
    fn test_invariant_violation_is_determinate() {
        let err = FactoryError::InvariantViolation("double destroy".to_string());
        assert!(!err.is_indeterminate());
    }
}
