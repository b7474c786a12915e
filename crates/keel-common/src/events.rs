//! Kubernetes Event recording for Keel controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Publishing returns a `Result`. The reconciler logs and moves on; the
//! rollout monitor uses the result to decide whether the completion event
//! still has to be recorded on the next tick.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::Error;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Synchronized")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) -> Result<(), Error>;
}

/// Publish an event and log a warning on failure.
///
/// For call sites where a lost event must never break reconciliation.
pub async fn publish_best_effort(
    publisher: &dyn EventPublisher,
    resource_ref: &ObjectReference,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    if let Err(e) = publisher
        .publish(resource_ref, type_, reason, action, note)
        .await
    {
        warn!(
            reason,
            action,
            error = %e,
            "Failed to publish Kubernetes event"
        );
    }
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) -> Result<(), Error> {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        self.recorder.publish(&event, resource_ref).await?;
        Ok(())
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// All operations of a rollout were applied
    pub const SYNCHRONIZED: &str = "Synchronized";
    /// The spec could not be compiled into operations
    pub const FAILED_PREPARE: &str = "FailedPrepare";
    /// A transient failure interrupted execution; the rollout will be retried
    pub const RETRYING: &str = "Retrying";
    /// Execution failed in a way retrying cannot fix
    pub const FAILED_SYNCHRONIZATION: &str = "FailedSynchronization";
    /// The spec failed normalization
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// The workload finished rolling out
    pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";
    /// The workload failed to roll out
    pub const ROLLOUT_FAILED: &str = "RolloutFailed";
    /// The rollout monitor gave up waiting
    pub const ROLLOUT_TIMED_OUT: &str = "RolloutTimedOut";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Compiling a Source into operations
    pub const COMPILE: &str = "Compile";
    /// Applying operations against the cluster
    pub const APPLY: &str = "Apply";
    /// Watching a workload roll out
    pub const MONITOR: &str = "Monitor";
}
