//! KeelApplication and KeelJob reconciliation
//!
//! Each reconcile walks one Source through:
//! Idle → Preparing → Executing → Done
//!
//! - an unchanged spec hash stops before anything is written
//! - a compile failure is stored as `PrepareFailed` and retried on a fixed interval
//! - a transient execution failure is stored as `Retrying` and requeued with backoff
//! - a permanent one is stored as `FailedPermanently` together with the hash
//! - success is stored as `Synchronized` and hands the rollout to a monitor
//!
//! Per-object serialization and deduplication come from `kube::runtime::Controller`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use keel_common::crd::{
    KeelApplication, KeelJob, RolloutStatus, Source, SourceKey, SourceKind, SyncStatus,
    SynchronizationState,
};
use keel_common::events::{actions, publish_best_effort, reasons, EventPublisher, NoopEventPublisher};
use keel_common::metrics::ReconcileMetrics;
use keel_common::retry::RetryConfig;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::audit::{AuditEvent, AuditPublisher, LogAuditPublisher};
use crate::compiler::{CompileError, Operation, ResourceCompiler};
use crate::correlation::{IdGenerator, UuidGenerator};
use crate::error::{ErrorKind, ReconcileError};
use crate::executor::Executor;
use crate::monitor::{MonitorConfig, MonitorDeps, MonitorRegistry, RolloutMonitor};
use crate::normalize::normalize_and_hash;
use crate::options::{resolve_options, Options};
use crate::rollout::Rollout;
use crate::sources::SourceClient;
use crate::status::transition;
use crate::store::{ClusterStore, StoreReader};

/// Default wait before retrying a Source that failed to compile
pub const DEFAULT_PREPARE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Reconciler timing
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Fixed requeue after `PrepareFailed`
    pub prepare_retry_interval: Duration,
    /// Periodic requeue of settled Sources; `None` waits for a change
    pub resync_interval: Option<Duration>,
    /// Backoff for `Retrying` and for reconcile errors
    pub retry: RetryConfig,
    /// Rollout monitor timing
    pub monitor: MonitorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            prepare_retry_interval: DEFAULT_PREPARE_RETRY_INTERVAL,
            resync_interval: None,
            retry: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                backoff_multiplier: 2.0,
            },
            monitor: MonitorConfig::default(),
        }
    }
}

/// Shared state for the Source controllers
pub struct Context {
    /// Managed objects
    pub store: Arc<dyn ClusterStore>,
    /// Sources and their status
    pub sources: Arc<dyn SourceClient>,
    /// Kubernetes events
    pub events: Arc<dyn EventPublisher>,
    /// Audit events
    pub audit: Arc<dyn AuditPublisher>,
    /// Correlation ids
    pub ids: Arc<dyn IdGenerator>,
    /// Generator pipeline
    pub compiler: Arc<ResourceCompiler>,
    /// Cluster-wide options
    pub options: Options,
    /// Running rollout monitors
    pub monitors: Arc<MonitorRegistry>,
    /// Counters
    pub metrics: ReconcileMetrics,
    /// Timing
    pub config: ControllerConfig,
    /// Consecutive transient failures per Source
    failures: DashMap<SourceKey, u32>,
}

impl Context {
    /// Start building a context over a store and a Source client
    pub fn builder(store: Arc<dyn ClusterStore>, sources: Arc<dyn SourceClient>) -> ContextBuilder {
        ContextBuilder::new(store, sources)
    }

    /// Collaborators handed to each rollout monitor
    pub fn monitor_deps(&self) -> MonitorDeps {
        MonitorDeps {
            store: self.store.clone(),
            sources: self.sources.clone(),
            events: self.events.clone(),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
            config: self.config.monitor.clone(),
        }
    }

    /// Consecutive transient failures recorded for a Source
    pub fn failure_count(&self, key: &SourceKey) -> u32 {
        self.failures.get(key).map(|n| *n).unwrap_or(0)
    }

    fn record_failure(&self, key: &SourceKey) -> u32 {
        let mut count = self.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn settled(&self) -> Action {
        match self.config.resync_interval {
            Some(interval) => Action::requeue(interval),
            None => Action::await_change(),
        }
    }
}

/// Builder for [`Context`]
///
/// Everything except the store and the Source client has a default:
/// no-op events, audit events to the log, random correlation ids and the
/// core generators.
pub struct ContextBuilder {
    store: Arc<dyn ClusterStore>,
    sources: Arc<dyn SourceClient>,
    events: Option<Arc<dyn EventPublisher>>,
    audit: Option<Arc<dyn AuditPublisher>>,
    ids: Option<Arc<dyn IdGenerator>>,
    compiler: Option<ResourceCompiler>,
    options: Options,
    metrics: Option<ReconcileMetrics>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(store: Arc<dyn ClusterStore>, sources: Arc<dyn SourceClient>) -> Self {
        Self {
            store,
            sources,
            events: None,
            audit: None,
            ids: None,
            compiler: None,
            options: Options::default(),
            metrics: None,
            config: ControllerConfig::default(),
        }
    }

    /// Kubernetes event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Audit event publisher
    pub fn audit(mut self, audit: Arc<dyn AuditPublisher>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Correlation id generator
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Generator pipeline
    pub fn compiler(mut self, compiler: ResourceCompiler) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Cluster-wide options
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Counters
    pub fn metrics(mut self, metrics: ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Timing
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            sources: self.sources,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            audit: self.audit.unwrap_or_else(|| Arc::new(LogAuditPublisher)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            compiler: Arc::new(
                self.compiler
                    .unwrap_or_else(ResourceCompiler::with_core_generators),
            ),
            options: self.options,
            monitors: Arc::new(MonitorRegistry::new()),
            metrics: self.metrics.unwrap_or_else(ReconcileMetrics::from_global),
            config: self.config,
            failures: DashMap::new(),
        }
    }
}

/// Where a reconcile left the Source
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The Source no longer exists
    Gone,
    /// The spec hash matches the stored one
    UpToDate,
    /// The spec failed validation; nothing was stored
    Invalid,
    /// Options or compilation failed
    PrepareFailed,
    /// Execution hit a transient failure
    Retrying {
        /// Consecutive transient failures, starting at 1
        attempt: u32,
    },
    /// Execution failed in a way retrying cannot fix
    FailedPermanently,
    /// All operations applied; a monitor is watching the rollout
    Synchronized {
        /// Operations applied
        operations: usize,
    },
}

impl ReconcileOutcome {
    /// Requeue decision for the controller runtime
    pub fn action(&self, ctx: &Context) -> Action {
        match self {
            Self::PrepareFailed => Action::requeue(ctx.config.prepare_retry_interval),
            Self::Retrying { attempt } => {
                Action::requeue(ctx.config.retry.delay_for_attempt(*attempt))
            }
            Self::Gone
            | Self::UpToDate
            | Self::Invalid
            | Self::FailedPermanently
            | Self::Synchronized { .. } => ctx.settled(),
        }
    }
}

fn source_key<K: ResourceExt>(kind: SourceKind, obj: &K) -> Result<SourceKey, ReconcileError> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
    Ok(SourceKey::new(kind, namespace, name))
}

/// Reconcile a KeelApplication
pub async fn reconcile_application(
    app: Arc<KeelApplication>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let key = source_key(SourceKind::Application, app.as_ref())?;
    Ok(reconcile(&key, &ctx).await?.action(&ctx))
}

/// Reconcile a KeelJob
pub async fn reconcile_job(job: Arc<KeelJob>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let key = source_key(SourceKind::Job, job.as_ref())?;
    Ok(reconcile(&key, &ctx).await?.action(&ctx))
}

/// Error policy for KeelApplication reconciliation
pub fn error_policy_application(
    app: Arc<KeelApplication>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    error_policy(source_key(SourceKind::Application, app.as_ref()).ok(), error, &ctx)
}

/// Error policy for KeelJob reconciliation
pub fn error_policy_job(job: Arc<KeelJob>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error_policy(source_key(SourceKind::Job, job.as_ref()).ok(), error, &ctx)
}

fn error_policy(key: Option<SourceKey>, error: &ReconcileError, ctx: &Context) -> Action {
    error!(?error, source = ?key, "reconciliation failed");
    match key {
        Some(key) if error.is_retryable() => {
            let attempt = ctx.record_failure(&key);
            Action::requeue(ctx.config.retry.delay_for_attempt(attempt))
        }
        _ => Action::await_change(),
    }
}

/// Run one reconciliation of the Source identified by `key`
#[instrument(skip(key, ctx), fields(source = %key, correlation_id = tracing::field::Empty))]
pub async fn reconcile(key: &SourceKey, ctx: &Context) -> Result<ReconcileOutcome, ReconcileError> {
    let Some(source) = ctx
        .sources
        .get(key)
        .await
        .map_err(|e| ReconcileError::store("fetch source", e))?
    else {
        debug!("source deleted");
        ctx.monitors.cancel(key);
        ctx.failures.remove(key);
        return Ok(ReconcileOutcome::Gone);
    };

    let (mut normalized, hash) = match normalize_and_hash(&source) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(error = %e, "invalid spec");
            publish_best_effort(
                ctx.events.as_ref(),
                &source.object_ref(),
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
            return Ok(ReconcileOutcome::Invalid);
        }
    };

    if source.synchronization_hash() == Some(hash.as_str()) {
        debug!(hash = %hash, "spec unchanged");
        return Ok(ReconcileOutcome::UpToDate);
    }

    let source = match source.correlation_id() {
        Some(_) => source,
        None => {
            let id = ctx.ids.generate();
            ctx.sources
                .set_correlation_id(key, &id)
                .await
                .map_err(|e| ReconcileError::store("set correlation id", e))?
        }
    };
    *normalized.meta_mut() = source.meta().clone();
    let correlation_id = source.correlation_id().unwrap_or_default().to_string();
    Span::current().record("correlation_id", correlation_id.as_str());

    let (options, operations) = match prepare(&normalized, ctx).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(error = %e, "failed to prepare rollout");
            let mut status = transition(&source, SynchronizationState::PrepareFailed);
            status.correlation_id = Some(correlation_id);
            status.message = Some(e.to_string());
            persist(ctx, key, &source, status).await?;
            publish_best_effort(
                ctx.events.as_ref(),
                &source.object_ref(),
                EventType::Warning,
                reasons::FAILED_PREPARE,
                actions::COMPILE,
                Some(e.to_string()),
            )
            .await;
            return Ok(ReconcileOutcome::PrepareFailed);
        }
    };

    // The workload is about to change; the previous rollout's monitor is stale
    ctx.monitors.cancel(key);

    let executed = match Rollout::new(
        key.clone(),
        normalized,
        options,
        operations,
        correlation_id.clone(),
        hash.clone(),
    ) {
        Ok(rollout) => Executor::new(ctx.store.as_ref())
            .execute(&rollout)
            .await
            .map(|report| (rollout, report)),
        Err(e) => Err(e),
    };

    match executed {
        Err(e) if e.kind() == ErrorKind::Transient => {
            let attempt = ctx.record_failure(key);
            warn!(error = %e, attempt, "transient failure applying rollout");
            let mut status = transition(&source, SynchronizationState::Retrying);
            status.correlation_id = Some(correlation_id);
            status.message = Some(e.to_string());
            persist(ctx, key, &source, status).await?;
            ctx.metrics.record_retry(key.kind.as_str());
            publish_best_effort(
                ctx.events.as_ref(),
                &source.object_ref(),
                EventType::Warning,
                reasons::RETRYING,
                actions::APPLY,
                Some(e.to_string()),
            )
            .await;
            Ok(ReconcileOutcome::Retrying { attempt })
        }
        Err(e) => {
            ctx.failures.remove(key);
            error!(error = %e, "rollout failed permanently");
            let mut status = transition(&source, SynchronizationState::FailedPermanently);
            status.synchronization_hash = Some(hash);
            status.correlation_id = Some(correlation_id);
            status.message = Some(e.to_string());
            persist(ctx, key, &source, status).await?;
            publish_best_effort(
                ctx.events.as_ref(),
                &source.object_ref(),
                EventType::Warning,
                reasons::FAILED_SYNCHRONIZATION,
                actions::APPLY,
                Some(e.to_string()),
            )
            .await;
            Ok(ReconcileOutcome::FailedPermanently)
        }
        Ok((rollout, report)) => {
            ctx.failures.remove(key);
            let mut status = transition(&source, SynchronizationState::Synchronized);
            status.synchronization_hash = Some(hash);
            status.correlation_id = Some(correlation_id);
            status.deployment_rollout_status = Some(RolloutStatus::Initialized);
            persist(ctx, key, &source, status).await?;
            ctx.metrics
                .record_resources_generated(key.kind.as_str(), report.applied);
            info!(
                operations = report.applied,
                orphans_deleted = report.orphans_deleted,
                image = %rollout.image,
                "synchronized"
            );
            publish_best_effort(
                ctx.events.as_ref(),
                &source.object_ref(),
                EventType::Normal,
                reasons::SYNCHRONIZED,
                actions::APPLY,
                Some(format!("applied {} operations", report.applied)),
            )
            .await;

            let event = AuditEvent::for_rollout(&rollout, RolloutStatus::Initialized, Utc::now());
            if let Err(e) = ctx.audit.publish(&event).await {
                warn!(error = %e, "failed to publish audit event");
            }

            RolloutMonitor::spawn(rollout, ctx.monitor_deps(), ctx.monitors.clone());
            Ok(ReconcileOutcome::Synchronized {
                operations: report.applied,
            })
        }
    }
}

async fn prepare(
    source: &Source,
    ctx: &Context,
) -> Result<(Options, Vec<Operation>), CompileError> {
    let store = StoreReader::new(ctx.store.as_ref());
    let options = resolve_options(&ctx.options, source, store).await?;
    let operations = ctx.compiler.compile(source, &options, store).await?;
    Ok((options, operations))
}

async fn persist(
    ctx: &Context,
    key: &SourceKey,
    source: &Source,
    status: SyncStatus,
) -> Result<(), ReconcileError> {
    let state = status.synchronization_state;
    ctx.sources
        .update_status(key, source.resource_version(), &status)
        .await
        .map_err(|e| ReconcileError::store("update status", e))?;
    if let Some(state) = state {
        ctx.metrics
            .record_synchronization(key.kind.as_str(), &state.to_string());
    }
    Ok(())
}
