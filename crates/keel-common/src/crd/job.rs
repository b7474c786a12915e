//! KeelJob CRD types
//!
//! A run-to-completion workload backed by a batch/v1 Job.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::container::ContainerSpec;
use super::status::SyncStatus;

/// Batch workload specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "KeelJob",
    plural = "keeljobs",
    shortname = "kjob",
    namespaced,
    status = "SyncStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.synchronizationState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeelJobSpec {
    /// Main container
    #[serde(flatten)]
    pub container: ContainerSpec,

    /// Retries before the Job is marked failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Wall-clock limit for the Job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// How long a finished Job is kept around
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}
