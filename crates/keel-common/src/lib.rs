//! Common types for Keel: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name reported as the controller/field manager on everything Keel writes
pub const CONTROLLER_NAME: &str = "keel-controller";

/// Source system identifier used in audit events
pub const SOURCE_SYSTEM: &str = "keel";

// =============================================================================
// Annotations
// =============================================================================

/// Correlation id carried on a Source across its whole rollout
pub const CORRELATION_ID_ANNOTATION: &str = "keel.dev/correlation-id";

/// Deletion policy for generated objects; `abandon` exempts them from orphan collection
pub const DELETION_POLICY_ANNOTATION: &str = "keel.dev/deletion-policy";

/// Value of [`DELETION_POLICY_ANNOTATION`] that keeps an object alive
pub const DELETION_POLICY_ABANDON: &str = "abandon";

/// Per-tenant project identifier, read from the Source or its Namespace
pub const PROJECT_ID_ANNOTATION: &str = "keel.dev/project-id";

/// Marks an object whose live spec is merged into the desired spec on update
pub const STATE_INTO_SPEC_ANNOTATION: &str = "keel.dev/state-into-spec";

/// Value of [`STATE_INTO_SPEC_ANNOTATION`] that enables the merge
pub const STATE_INTO_SPEC_MERGE: &str = "merge";

/// Identity of whoever triggered the deployment
pub const DEPLOYER_IDENT_ANNOTATION: &str = "keel.dev/deployer-ident";

/// Email of whoever triggered the deployment
pub const DEPLOYER_EMAIL_ANNOTATION: &str = "keel.dev/deployer-email";

/// Display name of whoever triggered the deployment
pub const DEPLOYER_NAME_ANNOTATION: &str = "keel.dev/deployer-name";

/// Source control reference the image was built from
pub const COMMIT_REF_ANNOTATION: &str = "keel.dev/commit-ref";

/// Prefix for annotations stamped on Secrets referenced by a workload
pub const REFERENCED_BY_ANNOTATION_PREFIX: &str = "keel.dev/referenced-by-";

// =============================================================================
// Labels
// =============================================================================

/// Label carrying the owning application name on every generated object
pub const APP_LABEL: &str = "app";

/// Label naming the owning team
pub const TEAM_LABEL: &str = "team";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on Keel-generated objects
pub const MANAGED_BY_VALUE: &str = "keel";
