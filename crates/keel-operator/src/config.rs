//! Command-line and environment configuration

use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use keel_engine::controller::DEFAULT_PREPARE_RETRY_INTERVAL;
use keel_engine::monitor::DEFAULT_POLL_INTERVAL;
use keel_engine::{ControllerConfig, Features, MonitorConfig, Options};

/// Keel - synthesizes and rolls out Kubernetes workloads from KeelApplication and KeelJob resources
#[derive(Parser, Debug)]
#[command(name = "keel-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Runtime settings
    #[command(flatten)]
    pub settings: Settings,

    /// Mode to run in
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator modes
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the KeelApplication and KeelJob controllers (default)
    Controller,
}

/// Settings shared by every mode
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Name of the cluster the operator runs in
    #[arg(long, env = "KEEL_CLUSTER_NAME", default_value = "local")]
    pub cluster_name: String,

    /// Generate HorizontalPodAutoscalers for applications
    #[arg(long, env = "KEEL_AUTOSCALING", default_value_t = false, action = ArgAction::Set)]
    pub autoscaling: bool,

    /// Refuse to roll out Sources without a project id
    #[arg(long, env = "KEEL_REQUIRE_PROJECT_ID", default_value_t = false, action = ArgAction::Set)]
    pub require_project_id: bool,

    /// Concurrent reconciliations per Source kind
    #[arg(long, env = "KEEL_WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// Seconds between rollout probes
    #[arg(long, env = "KEEL_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub poll_interval_secs: u64,

    /// Give up monitoring a rollout after this many seconds
    #[arg(long, env = "KEEL_ROLLOUT_TIMEOUT_SECS")]
    pub rollout_timeout_secs: Option<u64>,

    /// Seconds before retrying a Source that failed to compile
    #[arg(long, env = "KEEL_PREPARE_RETRY_SECS", default_value_t = DEFAULT_PREPARE_RETRY_INTERVAL.as_secs())]
    pub prepare_retry_secs: u64,

    /// Periodically requeue settled Sources every this many seconds
    #[arg(long, env = "KEEL_RESYNC_SECS")]
    pub resync_secs: Option<u64>,

    /// Emit JSON log lines
    #[arg(long, env = "KEEL_LOG_JSON", default_value_t = true, action = ArgAction::Set)]
    pub log_json: bool,
}

impl Settings {
    /// Cluster-wide rollout options
    pub fn options(&self) -> Options {
        Options {
            cluster_name: self.cluster_name.clone(),
            features: Features {
                autoscaling: self.autoscaling,
                require_project_id: self.require_project_id,
            },
            project_id: None,
        }
    }

    /// Reconciler and monitor timing
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            prepare_retry_interval: Duration::from_secs(self.prepare_retry_secs),
            resync_interval: self.resync_secs.map(Duration::from_secs),
            monitor: MonitorConfig {
                poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
                timeout: self.rollout_timeout_secs.map(Duration::from_secs),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_optional_features_off() {
        let cli = Cli::try_parse_from(["keel-operator"]).unwrap();
        assert!(!cli.crd);
        assert_eq!(cli.command, None);

        let config = cli.settings.controller_config();
        assert_eq!(config.prepare_retry_interval, Duration::from_secs(60));
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.timeout, None);
        assert_eq!(config.resync_interval, None);
    }

    #[test]
    fn flags_flow_into_options() {
        let cli = Cli::try_parse_from([
            "keel-operator",
            "--cluster-name",
            "prod-eu-1",
            "--autoscaling",
            "true",
            "--require-project-id",
            "true",
            "--rollout-timeout-secs",
            "900",
            "controller",
        ])
        .unwrap();

        let options = cli.settings.options();
        assert_eq!(options.cluster_name, "prod-eu-1");
        assert!(options.features.autoscaling);
        assert!(options.features.require_project_id);
        assert_eq!(
            cli.settings.controller_config().monitor.timeout,
            Some(Duration::from_secs(900))
        );
        assert_eq!(cli.command, Some(Commands::Controller));
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let cli =
            Cli::try_parse_from(["keel-operator", "--poll-interval-secs", "0"]).unwrap();
        assert_eq!(
            cli.settings.controller_config().monitor.poll_interval,
            Duration::from_secs(1)
        );
    }
}
