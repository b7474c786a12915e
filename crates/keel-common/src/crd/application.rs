//! KeelApplication CRD types
//!
//! A long-running service: one Deployment behind a ClusterIP Service, with an
//! optional HorizontalPodAutoscaler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::container::ContainerSpec;
use super::status::SyncStatus;

/// Replica bounds and autoscaling target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasSpec {
    /// Lower bound (and the fixed count when not autoscaling)
    pub min: i32,
    /// Upper bound for the autoscaler
    pub max: i32,
    /// Average CPU utilisation the autoscaler aims for
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_percentage: i32,
}

fn default_cpu_threshold() -> i32 {
    50
}

/// Long-running workload specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "KeelApplication",
    plural = "keelapplications",
    shortname = "kapp",
    namespaced,
    status = "SyncStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.synchronizationState"}"#,
    printcolumn = r#"{"name":"Rollout","type":"string","jsonPath":".status.deploymentRolloutStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeelApplicationSpec {
    /// Main container
    #[serde(flatten)]
    pub container: ContainerSpec,

    /// Port the container listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Replica bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ReplicasSpec>,
}
