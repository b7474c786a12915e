//! Error types for the Keel operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object or context it was raised for.

use thiserror::Error;

/// Main error type for shared Keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A typed object could not be converted to or from JSON
    #[error("serialization error for {kind}: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized
        kind: String,
    },
}

impl Error {
    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: kind.into(),
        }
    }
}
