//! Keel Operator - synthesizes and rolls out workloads from Keel resources

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use keel_common::retry::{retry_with_backoff, RetryConfig};
use keel_common::telemetry::{init_telemetry, TelemetryConfig};
use keel_common::{KubeEventPublisher, CONTROLLER_NAME};
use keel_engine::audit::LogAuditPublisher;
use keel_engine::sources::KubeSourceClient;
use keel_engine::store::KubeStore;
use keel_engine::Context;
use keel_operator::config::{Cli, Commands, Settings};
use keel_operator::controller_runner::build_source_controllers;
use keel_operator::crds::{crds_yaml, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS connection is made
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "keel-operator".to_string(),
        json: cli.settings.log_json,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.settings).await,
    }
}

async fn run_controller(settings: Settings) -> anyhow::Result<()> {
    tracing::info!(cluster = %settings.cluster_name, "Keel controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crds", || {
        ensure_crds_installed(&client)
    })
    .await?;

    let ctx = Arc::new(
        Context::builder(
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(KubeSourceClient::new(client.clone())),
        )
        .events(Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)))
        .audit(Arc::new(LogAuditPublisher))
        .options(settings.options())
        .config(settings.controller_config())
        .build(),
    );

    let controllers = build_source_controllers(client, ctx.clone(), settings.workers);
    futures::future::join_all(controllers).await;

    ctx.monitors.cancel_all();
    tracing::info!("Keel controller stopped");
    Ok(())
}
