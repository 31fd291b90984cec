//! Node provider errors.

use thiserror::Error;

use crate::providers::BackendError;

/// Errors surfaced by the node provider.
///
/// Variants split into transient faults, which the retry wrapper absorbs by
/// reinitializing clients, and fatal ones that go straight to the caller.
/// See [`ProviderError::is_transient`].
#[derive(Error, Debug)]
pub enum ProviderError {
    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Instance creation was refused for quota reasons.
    #[error("Quota exceeded while creating instance {name}: {message}")]
    QuotaExceeded { name: String, message: String },

    /// An instance never reached `running` and was deleted.
    #[error("Instance {id} stayed pending for more than {timeout_secs}s and was deleted")]
    PendingTimeout { id: String, timeout_secs: u64 },

    /// Tags could not be confirmed on the resource.
    #[error("Failed to {operation} tags {tags:?} on {crn}")]
    TagVerification {
        operation: &'static str,
        crn: String,
        tags: Vec<String>,
    },

    /// The requested node name violates the naming rules.
    #[error("Invalid node name '{name}': {reason}")]
    InvalidNodeName { name: String, reason: String },

    /// Node is not known to the backend.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Some units of a batch create/terminate failed.
    #[error(
        "{} batch operation(s) failed, {} succeeded; first error: {}",
        .errors.len(),
        .completed.len(),
        .errors.first().map(ToString::to_string).unwrap_or_default()
    )]
    PartialBatch {
        completed: Vec<String>,
        errors: Vec<ProviderError>,
    },

    /// A spawned task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ProviderError {
    /// Whether retrying after a client reinit may succeed.
    ///
    /// Quota, naming, configuration and verification failures are
    /// business-level outcomes and never retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(e) => !matches!(
                e,
                BackendError::QuotaExceeded(_)
                    | BackendError::AlreadyExists(_)
                    | BackendError::NotFound(_)
            ),
            _ => false,
        }
    }

    /// Whether the error means the resource is already absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_not_found(),
            Self::NodeNotFound(_) => true,
            _ => false,
        }
    }
}
