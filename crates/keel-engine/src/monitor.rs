//! Rollout monitor
//!
//! After a successful execution the controller hands the rollout to a
//! [`RolloutMonitor`] running in its own task. The monitor polls the workload
//! until it has rolled out, then records the completion:
//!
//! 1. a Kubernetes event on the Source
//! 2. a `complete` audit event
//! 3. the `RolloutComplete` status, written only once step 1 succeeded
//!
//! Each step succeeds at most once and a failed step is retried on the next
//! tick without repeating the others.
//!
//! At most one monitor runs per Source. [`MonitorRegistry::register`] cancels
//! the previous monitor when a newer rollout starts, and a monitor that finds
//! the Source's stored hash changed stops on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_common::crd::{RolloutStatus, Source, SourceKey, SynchronizationState, WorkloadKind};
use keel_common::events::{actions, publish_best_effort, reasons, EventPublisher};
use keel_common::metrics::ReconcileMetrics;
use kube::api::DynamicObject;
use kube::runtime::events::EventType;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditPublisher};
use crate::rollout::Rollout;
use crate::sources::SourceClient;
use crate::status::{rollout_complete, transition};
use crate::store::ClusterStore;

/// Default interval between workload probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Message stored on the Source when its Job fails
pub const ROLLOUT_FAILED_MESSAGE: &str = "rollout failed";

// =============================================================================
// Registry
// =============================================================================

struct MonitorHandle {
    id: Uuid,
    cancel: CancellationToken,
}

/// Active monitors, at most one per Source
#[derive(Default)]
pub struct MonitorRegistry {
    handles: Mutex<HashMap<SourceKey, MonitorHandle>>,
}

impl MonitorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new monitor for `key`, cancelling the one it replaces
    pub fn register(&self, key: SourceKey) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let previous = self.handles.lock().insert(
            key,
            MonitorHandle {
                id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        (id, cancel)
    }

    /// Remove `key` if it still belongs to monitor `id`
    pub fn release(&self, key: &SourceKey, id: Uuid) -> bool {
        let mut handles = self.handles.lock();
        if handles.get(key).is_some_and(|h| h.id == id) {
            handles.remove(key);
            true
        } else {
            false
        }
    }

    /// Cancel and remove the monitor for `key`
    pub fn cancel(&self, key: &SourceKey) -> bool {
        match self.handles.lock().remove(key) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every monitor
    pub fn cancel_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.cancel.cancel();
        }
    }

    /// Whether a monitor is registered for `key`
    pub fn is_active(&self, key: &SourceKey) -> bool {
        self.handles.lock().contains_key(key)
    }

    /// Number of registered monitors
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether no monitor is registered
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

// =============================================================================
// Workload probes
// =============================================================================

/// Rollout state read from a workload object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Still rolling out
    Pending,
    /// Rolled out
    Complete,
    /// Will not roll out
    Failed,
}

fn int_at(obj: &DynamicObject, pointer: &str) -> Option<i64> {
    obj.data.pointer(pointer).and_then(Value::as_i64)
}

/// Read the rollout state of a workload object
pub fn probe(kind: WorkloadKind, obj: &DynamicObject) -> Probe {
    match kind {
        WorkloadKind::Deployment => probe_deployment(obj),
        WorkloadKind::Job => probe_job(obj),
    }
}

fn probe_deployment(obj: &DynamicObject) -> Probe {
    let Some(desired) = int_at(obj, "/spec/replicas") else {
        return Probe::Pending;
    };
    // The API server omits zero counts from status
    let count = |field: &str| int_at(obj, &format!("/status/{field}")).unwrap_or(0);
    let observed = match (obj.metadata.generation, int_at(obj, "/status/observedGeneration")) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    };

    let rolled_out = count("updatedReplicas") == desired
        && count("replicas") == desired
        && count("availableReplicas") == desired;
    if rolled_out && observed {
        Probe::Complete
    } else {
        Probe::Pending
    }
}

fn probe_job(obj: &DynamicObject) -> Probe {
    let conditions = obj
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for condition in conditions {
        if condition.get("status").and_then(Value::as_str) != Some("True") {
            continue;
        }
        match condition.get("type").and_then(Value::as_str) {
            Some("Complete") => return Probe::Complete,
            Some("Failed") => return Probe::Failed,
            _ => {}
        }
    }

    let started = obj.data.pointer("/status/startTime").is_some();
    let active = int_at(obj, "/status/active").unwrap_or(0);
    if !started || active > 0 {
        return Probe::Pending;
    }
    if int_at(obj, "/status/failed").unwrap_or(0) > 0 {
        Probe::Failed
    } else {
        Probe::Complete
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Monitor timing
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Interval between workload probes
    pub poll_interval: Duration,
    /// Give up after this long; `None` waits until superseded or cancelled
    pub timeout: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Collaborators shared by every monitor
#[derive(Clone)]
pub struct MonitorDeps {
    /// Workload reads
    pub store: Arc<dyn ClusterStore>,
    /// Source reads and status writes
    pub sources: Arc<dyn SourceClient>,
    /// Kubernetes events
    pub events: Arc<dyn EventPublisher>,
    /// Audit events
    pub audit: Arc<dyn AuditPublisher>,
    /// Rollout counters
    pub metrics: ReconcileMetrics,
    /// Timing
    pub config: MonitorConfig,
}

/// How a monitor ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Completion recorded
    Complete,
    /// Failure recorded
    Failed,
    /// Cancelled through the registry
    Cancelled,
    /// The Source moved on to another spec
    Superseded,
    /// The Source was deleted
    Deleted,
    /// The configured timeout elapsed
    TimedOut,
}

/// Completion side effects, each done at most once
#[derive(Default)]
struct Completion {
    event: Option<AuditEvent>,
    recorded: bool,
    published: bool,
    persisted: bool,
}

impl Completion {
    fn done(&self) -> bool {
        self.recorded && self.published && self.persisted
    }
}

#[derive(Default)]
struct Failure {
    recorded: bool,
    persisted: bool,
}

/// Watches one rollout to completion
pub struct RolloutMonitor {
    rollout: Rollout,
    deps: MonitorDeps,
    registry: Arc<MonitorRegistry>,
    id: Uuid,
    cancel: CancellationToken,
    completion: Completion,
    failure: Failure,
}

impl RolloutMonitor {
    /// Register a monitor for the rollout and start it on its own task.
    ///
    /// Any monitor already running for the same Source is cancelled before
    /// this returns.
    pub fn spawn(
        rollout: Rollout,
        deps: MonitorDeps,
        registry: Arc<MonitorRegistry>,
    ) -> JoinHandle<MonitorOutcome> {
        let (id, cancel) = registry.register(rollout.key.clone());
        let span = info_span!(
            "rollout_monitor",
            source = %rollout.key,
            correlation_id = %rollout.correlation_id,
        );
        let monitor = Self {
            rollout,
            deps,
            registry,
            id,
            cancel,
            completion: Completion::default(),
            failure: Failure::default(),
        };
        tokio::spawn(monitor.run().instrument(span))
    }

    async fn run(mut self) -> MonitorOutcome {
        let outcome = self.watch().await;
        self.registry.release(&self.rollout.key, self.id);
        info!(?outcome, "rollout monitor stopped");
        outcome
    }

    async fn watch(&mut self) -> MonitorOutcome {
        let deadline = self.deps.config.timeout.map(|t| Instant::now() + t);
        let mut interval = tokio::time::interval(self.deps.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return MonitorOutcome::Cancelled,
                _ = interval.tick() => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("rollout did not finish before the timeout");
                publish_best_effort(
                    self.deps.events.as_ref(),
                    &self.rollout.source.object_ref(),
                    EventType::Warning,
                    reasons::ROLLOUT_TIMED_OUT,
                    actions::MONITOR,
                    Some("rollout did not finish in time".to_string()),
                )
                .await;
                return MonitorOutcome::TimedOut;
            }

            if let Some(outcome) = self.tick().await {
                return outcome;
            }
        }
    }

    async fn tick(&mut self) -> Option<MonitorOutcome> {
        let key = &self.rollout.key;
        let source = match self.deps.sources.get(key).await {
            Ok(Some(source)) => source,
            Ok(None) => return Some(MonitorOutcome::Deleted),
            Err(e) => {
                warn!(error = %e, "failed to read source");
                return None;
            }
        };
        if source.synchronization_hash() != Some(self.rollout.hash.as_str()) {
            return Some(MonitorOutcome::Superseded);
        }

        // Once completion was observed it is not re-probed
        let state = if self.completion.event.is_some() {
            Probe::Complete
        } else if self.failure.recorded || self.failure.persisted {
            Probe::Failed
        } else {
            let workload = self.rollout.source.workload_kind();
            match self
                .deps
                .store
                .get(&workload.api_resource(), Some(&key.namespace), &key.name)
                .await
            {
                Ok(Some(obj)) => probe(workload, &obj),
                Ok(None) => {
                    debug!("workload not found yet");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read workload");
                    return None;
                }
            }
        };

        match state {
            Probe::Pending => None,
            Probe::Complete => self.complete(&source).await,
            Probe::Failed => self.fail(&source).await,
        }
    }

    async fn complete(&mut self, source: &Source) -> Option<MonitorOutcome> {
        let rollout = &self.rollout;
        let event = self
            .completion
            .event
            .get_or_insert_with(|| AuditEvent::for_rollout(rollout, RolloutStatus::Complete, Utc::now()))
            .clone();

        if self.cancel.is_cancelled() {
            return Some(MonitorOutcome::Cancelled);
        }
        if !self.completion.recorded {
            match self
                .deps
                .events
                .publish(
                    &source.object_ref(),
                    EventType::Normal,
                    reasons::ROLLOUT_COMPLETE,
                    actions::MONITOR,
                    Some(format!("rolled out {}", event.image)),
                )
                .await
            {
                Ok(()) => self.completion.recorded = true,
                Err(e) => warn!(error = %e, "failed to record rollout event"),
            }
        }

        if self.cancel.is_cancelled() {
            return Some(MonitorOutcome::Cancelled);
        }
        if !self.completion.published {
            match self.deps.audit.publish(&event).await {
                Ok(()) => self.completion.published = true,
                Err(e) => warn!(error = %e, "failed to publish audit event"),
            }
        }

        if self.cancel.is_cancelled() {
            return Some(MonitorOutcome::Cancelled);
        }
        if self.completion.recorded && !self.completion.persisted {
            match self
                .deps
                .sources
                .update_status(
                    &self.rollout.key,
                    source.resource_version(),
                    &rollout_complete(source),
                )
                .await
            {
                Ok(_) => {
                    self.completion.persisted = true;
                    self.deps
                        .metrics
                        .record_rollout_complete(self.rollout.key.kind.as_str());
                }
                Err(e) => warn!(error = %e, "failed to persist rollout status"),
            }
        }

        self.completion.done().then_some(MonitorOutcome::Complete)
    }

    async fn fail(&mut self, source: &Source) -> Option<MonitorOutcome> {
        if self.cancel.is_cancelled() {
            return Some(MonitorOutcome::Cancelled);
        }
        if !self.failure.recorded {
            match self
                .deps
                .events
                .publish(
                    &source.object_ref(),
                    EventType::Warning,
                    reasons::ROLLOUT_FAILED,
                    actions::MONITOR,
                    Some(ROLLOUT_FAILED_MESSAGE.to_string()),
                )
                .await
            {
                Ok(()) => self.failure.recorded = true,
                Err(e) => warn!(error = %e, "failed to record rollout failure event"),
            }
        }

        if self.cancel.is_cancelled() {
            return Some(MonitorOutcome::Cancelled);
        }
        if !self.failure.persisted {
            let mut status = transition(source, SynchronizationState::FailedPermanently);
            status.message = Some(ROLLOUT_FAILED_MESSAGE.to_string());
            match self
                .deps
                .sources
                .update_status(&self.rollout.key, source.resource_version(), &status)
                .await
            {
                Ok(_) => self.failure.persisted = true,
                Err(e) => warn!(error = %e, "failed to persist rollout failure"),
            }
        }

        (self.failure.recorded && self.failure.persisted).then_some(MonitorOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, MockAuditPublisher};
    use crate::testing::{
        dynamic, sample_job, sample_rollout, MemorySourceClient, MemoryStore, RecordingEvents,
    };
    use keel_common::crd::{SourceKind, SyncStatus};
    use kube::discovery::ApiResource;
    use serde_json::json;

    fn deployment(replicas: i64, ready: i64, generation: i64, observed: i64) -> DynamicObject {
        dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "app-a", "namespace": "team-a", "generation": generation},
            "spec": {"replicas": replicas},
            "status": {
                "observedGeneration": observed,
                "replicas": ready,
                "updatedReplicas": ready,
                "availableReplicas": ready
            }
        }))
    }

    fn job(status: Value) -> DynamicObject {
        dynamic(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "team-a"},
            "spec": {},
            "status": status
        }))
    }

    struct Harness {
        store: Arc<MemoryStore>,
        sources: Arc<MemorySourceClient>,
        events: Arc<RecordingEvents>,
        registry: Arc<MonitorRegistry>,
        rollout: Rollout,
    }

    impl Harness {
        /// A rollout whose hash is already stored on the Source
        fn new(rollout: Rollout) -> Self {
            let sources = Arc::new(MemorySourceClient::new());
            let mut source = rollout.source.clone();
            set_status(
                &mut source,
                SyncStatus {
                    synchronization_state: Some(SynchronizationState::Synchronized),
                    synchronization_hash: Some(rollout.hash.clone()),
                    correlation_id: Some(rollout.correlation_id.clone()),
                    deployment_rollout_status: Some(RolloutStatus::Initialized),
                    ..Default::default()
                },
            );
            sources.insert(source);
            Self {
                store: Arc::new(MemoryStore::new()),
                sources,
                events: Arc::new(RecordingEvents::new()),
                registry: Arc::new(MonitorRegistry::new()),
                rollout,
            }
        }

        fn deps(&self, audit: impl AuditPublisher + 'static) -> MonitorDeps {
            MonitorDeps {
                store: self.store.clone(),
                sources: self.sources.clone(),
                events: self.events.clone(),
                audit: Arc::new(audit),
                metrics: ReconcileMetrics::from_global(),
                config: MonitorConfig::default(),
            }
        }

        fn spawn(&self, audit: impl AuditPublisher + 'static) -> JoinHandle<MonitorOutcome> {
            RolloutMonitor::spawn(self.rollout.clone(), self.deps(audit), self.registry.clone())
        }

        fn status(&self) -> SyncStatus {
            self.sources
                .source(&self.rollout.key)
                .and_then(|s| s.status().cloned())
                .unwrap_or_default()
        }
    }

    fn set_status(source: &mut Source, status: SyncStatus) {
        match source {
            Source::Application(app) => app.status = Some(status),
            Source::Job(job) => job.status = Some(status),
        }
    }

    fn deployment_ar() -> ApiResource {
        WorkloadKind::Deployment.api_resource()
    }

    fn job_ar() -> ApiResource {
        WorkloadKind::Job.api_resource()
    }

    #[test]
    fn deployment_probe_requires_all_counts_and_observed_generation() {
        let kind = WorkloadKind::Deployment;
        assert_eq!(probe(kind, &deployment(3, 3, 2, 2)), Probe::Complete);
        assert_eq!(probe(kind, &deployment(3, 2, 2, 2)), Probe::Pending);
        assert_eq!(probe(kind, &deployment(3, 3, 3, 2)), Probe::Pending);

        let no_replicas = dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "app-a", "namespace": "team-a"},
            "spec": {}
        }));
        assert_eq!(probe(kind, &no_replicas), Probe::Pending);
    }

    #[test]
    fn job_conditions_win_over_counts() {
        let kind = WorkloadKind::Job;
        let complete = job(json!({
            "active": 1,
            "conditions": [{"type": "Complete", "status": "True"}]
        }));
        assert_eq!(probe(kind, &complete), Probe::Complete);

        let failed = job(json!({"conditions": [{"type": "Failed", "status": "True"}]}));
        assert_eq!(probe(kind, &failed), Probe::Failed);

        let not_yet = job(json!({"conditions": [{"type": "Complete", "status": "False"}]}));
        assert_eq!(probe(kind, &not_yet), Probe::Pending);
    }

    #[test]
    fn job_without_conditions_uses_pod_counts() {
        let kind = WorkloadKind::Job;
        let started = "2026-01-01T00:00:00Z";
        assert_eq!(probe(kind, &job(json!({}))), Probe::Pending);
        assert_eq!(
            probe(kind, &job(json!({"startTime": started, "active": 1}))),
            Probe::Pending
        );
        assert_eq!(
            probe(kind, &job(json!({"startTime": started, "succeeded": 1}))),
            Probe::Complete
        );
        assert_eq!(
            probe(kind, &job(json!({"startTime": started, "failed": 2}))),
            Probe::Failed
        );
    }

    #[test]
    fn register_replaces_and_cancels_previous_monitor() {
        let registry = MonitorRegistry::new();
        let key = SourceKey::new(SourceKind::Application, "team-a", "app-a");

        let (first_id, first) = registry.register(key.clone());
        let (second_id, second) = registry.register(key.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert!(!registry.release(&key, first_id));
        assert!(registry.is_active(&key));
        assert!(registry.release(&key, second_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_cancels_every_monitor() {
        let registry = MonitorRegistry::new();
        let (_, a) = registry.register(SourceKey::new(SourceKind::Application, "ns", "a"));
        let (_, b) = registry.register(SourceKey::new(SourceKind::Job, "ns", "b"));

        registry.cancel_all();

        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(registry.is_empty());
    }

    /// Story: a finished deployment produces exactly one audit event and one status write
    #[tokio::test(start_paused = true)]
    async fn story_completion_recorded_once() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        harness.store.insert(&deployment_ar(), deployment(2, 0, 1, 1));

        let mut audit = MockAuditPublisher::new();
        audit
            .expect_publish()
            .withf(|event| event.rollout_status == RolloutStatus::Complete)
            .times(1)
            .returning(|_| Ok(()));
        let handle = harness.spawn(audit);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(harness.registry.is_active(&harness.rollout.key));
        harness.store.insert(&deployment_ar(), deployment(2, 2, 1, 1));

        assert_eq!(handle.await.unwrap(), MonitorOutcome::Complete);
        let status = harness.status();
        assert_eq!(
            status.synchronization_state,
            Some(SynchronizationState::RolloutComplete)
        );
        assert_eq!(status.deployment_rollout_status, Some(RolloutStatus::Complete));
        assert!(status.rollout_complete_time.is_some());
        assert_eq!(harness.events.reasons(), vec![reasons::ROLLOUT_COMPLETE]);
        assert!(!harness.registry.is_active(&harness.rollout.key));
    }

    #[tokio::test(start_paused = true)]
    async fn audit_failure_retried_without_repeating_other_steps() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        harness.store.insert(&deployment_ar(), deployment(1, 1, 1, 1));

        let mut audit = MockAuditPublisher::new();
        let mut seq = mockall::Sequence::new();
        audit
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(AuditError::Publish("bus down".to_string())));
        audit
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let outcome = harness.spawn(audit).await.unwrap();

        assert_eq!(outcome, MonitorOutcome::Complete);
        assert_eq!(harness.events.reasons(), vec![reasons::ROLLOUT_COMPLETE]);
        assert_eq!(harness.sources.status_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_waits_for_kubernetes_event() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        harness.store.insert(&deployment_ar(), deployment(1, 1, 1, 1));
        harness.events.fail_next(2);

        let mut audit = MockAuditPublisher::new();
        audit.expect_publish().times(1).returning(|_| Ok(()));
        let handle = harness.spawn(audit);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(harness.sources.status_writes(), 0);

        assert_eq!(handle.await.unwrap(), MonitorOutcome::Complete);
        assert_eq!(harness.events.reasons(), vec![reasons::ROLLOUT_COMPLETE]);
        assert_eq!(harness.sources.status_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_marks_source_failed_without_audit() {
        let rollout = sample_rollout_job();
        let harness = Harness::new(rollout);
        let failed = job(json!({"conditions": [{"type": "Failed", "status": "True"}]}));
        harness.store.insert(&job_ar(), failed);

        let mut audit = MockAuditPublisher::new();
        audit.expect_publish().never();

        assert_eq!(harness.spawn(audit).await.unwrap(), MonitorOutcome::Failed);
        let status = harness.status();
        assert_eq!(
            status.synchronization_state,
            Some(SynchronizationState::FailedPermanently)
        );
        assert_eq!(status.message.as_deref(), Some(ROLLOUT_FAILED_MESSAGE));
        assert_eq!(harness.events.reasons(), vec![reasons::ROLLOUT_FAILED]);
    }

    fn sample_rollout_job() -> Rollout {
        let source = sample_job("migrate", "team-a", "repo/migrate:v1");
        let mut rollout = sample_rollout("migrate", "team-a", "repo/migrate:v1");
        rollout.key = source.key().unwrap();
        rollout.source = source;
        rollout
    }

    /// Story: a newer rollout cancels the old monitor before it can report
    #[tokio::test(start_paused = true)]
    async fn story_superseded_monitor_has_no_side_effects() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        harness.store.insert(&deployment_ar(), deployment(2, 0, 1, 1));

        let mut first_audit = MockAuditPublisher::new();
        first_audit.expect_publish().never();
        let first = harness.spawn(first_audit);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut second_audit = MockAuditPublisher::new();
        second_audit.expect_publish().times(1).returning(|_| Ok(()));
        let second = harness.spawn(second_audit);

        assert_eq!(first.await.unwrap(), MonitorOutcome::Cancelled);
        harness.store.insert(&deployment_ar(), deployment(2, 2, 1, 1));
        assert_eq!(second.await.unwrap(), MonitorOutcome::Complete);
        assert_eq!(harness.events.reasons(), vec![reasons::ROLLOUT_COMPLETE]);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_hash_stops_monitor() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        let mut source = harness.sources.source(&harness.rollout.key).unwrap();
        set_status(
            &mut source,
            SyncStatus {
                synchronization_hash: Some("other".to_string()),
                ..Default::default()
            },
        );
        harness.sources.insert(source);

        let mut audit = MockAuditPublisher::new();
        audit.expect_publish().never();

        assert_eq!(harness.spawn(audit).await.unwrap(), MonitorOutcome::Superseded);
        assert!(harness.events.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_workload_keeps_waiting_until_timeout() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        let mut deps = harness.deps(MockAuditPublisher::new());
        deps.config.timeout = Some(Duration::from_secs(60));

        let handle = RolloutMonitor::spawn(harness.rollout.clone(), deps, harness.registry.clone());

        assert_eq!(handle.await.unwrap(), MonitorOutcome::TimedOut);
        assert_eq!(harness.events.reasons(), vec![reasons::ROLLOUT_TIMED_OUT]);
        assert_eq!(harness.sources.status_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_source_stops_monitor() {
        let harness = Harness::new(sample_rollout("app-a", "team-a", "repo/app:v1"));
        harness.sources.remove(&harness.rollout.key);

        let mut audit = MockAuditPublisher::new();
        audit.expect_publish().never();

        assert_eq!(harness.spawn(audit).await.unwrap(), MonitorOutcome::Deleted);
    }
}
