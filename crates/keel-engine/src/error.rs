//! Error classification for execution and reconciliation
//!
//! Every failure that reaches the controller is sorted into [`ErrorKind`]
//! by its variant, never by inspecting message text.

use thiserror::Error;

use crate::audit::ImageParseError;
use crate::compiler::OperationKind;
use crate::store::StoreError;

/// Whether retrying can fix a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff; the spec hash is not stored
    Transient,
    /// Give up until the spec changes; the spec hash is stored
    Permanent,
}

/// Failure while applying a rollout's operations
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// A store call failed for one operation
    #[error("{operation} {kind}/{name}: {source}")]
    Store {
        /// Operation being applied
        operation: OperationKind,
        /// Target kind
        kind: String,
        /// Target name
        name: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// Listing or deleting during orphan collection failed
    #[error("orphan collection of {kind}: {source}")]
    Sweep {
        /// Tracked kind being swept
        kind: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// The container image reference cannot be parsed
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageParseError),

    /// A desired object could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExecuteError {
    /// Transient or permanent
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store { source, .. } | Self::Sweep { source, .. } => source.kind(),
            Self::InvalidImage(_) | Self::Serialization(_) => ErrorKind::Permanent,
        }
    }
}

/// Failure outside the classified reconcile states
///
/// These are handed to the controller's error policy and requeued with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading the Source or persisting its status failed
    #[error("{action} failed: {source}")]
    Store {
        /// What the reconciler was doing
        action: &'static str,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// Source objects must be namespaced
    #[error("missing namespace on {0}")]
    MissingNamespace(String),
}

impl ReconcileError {
    /// Wrap a store failure with the action that caused it
    pub fn store(action: &'static str, source: StoreError) -> Self {
        Self::Store { action, source }
    }

    /// Whether the error policy should requeue
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.kind() == ErrorKind::Transient,
            Self::MissingNamespace(_) => false,
        }
    }
}
