//! Controller runner - builds one controller future per Source kind
//!
//! Returns boxed futures so the caller decides how to drive them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as RuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use keel_common::crd::{KeelApplication, KeelJob};
use keel_engine::controller::{
    error_policy_application, error_policy_job, reconcile_application, reconcile_job,
};
use keel_engine::Context;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the KeelApplication and KeelJob controller futures
///
/// `workers` bounds concurrent reconciliations per kind; the runtime never
/// reconciles the same object twice at once.
pub fn build_source_controllers(
    client: Client,
    ctx: Arc<Context>,
    workers: u16,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let applications: Api<KeelApplication> = Api::all(client.clone());
    let jobs: Api<KeelJob> = Api::all(client);
    let config = RuntimeConfig::default().concurrency(workers);

    tracing::info!(workers, "- KeelApplication controller");
    tracing::info!(workers, "- KeelJob controller");

    vec![
        Box::pin(
            Controller::new(
                applications,
                WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            )
            .with_config(config.clone())
            .shutdown_on_signal()
            .run(reconcile_application, error_policy_application, ctx.clone())
            .for_each(log_reconcile_result("KeelApplication")),
        ),
        Box::pin(
            Controller::new(jobs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
                .with_config(config)
                .shutdown_on_signal()
                .run(reconcile_job, error_policy_job, ctx)
                .for_each(log_reconcile_result("KeelJob")),
        ),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
