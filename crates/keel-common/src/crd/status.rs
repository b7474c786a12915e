//! Status sub-resource shared by KeelApplication and KeelJob

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of the most recent reconciliation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SynchronizationState {
    /// Spec could not be compiled; retried on a fixed interval
    PrepareFailed,
    /// All operations applied; rollout in progress
    Synchronized,
    /// A transient failure interrupted execution
    Retrying,
    /// Execution or rollout failed in a way retrying cannot fix
    FailedPermanently,
    /// The workload finished rolling out
    RolloutComplete,
}

impl std::fmt::Display for SynchronizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrepareFailed => write!(f, "PrepareFailed"),
            Self::Synchronized => write!(f, "Synchronized"),
            Self::Retrying => write!(f, "Retrying"),
            Self::FailedPermanently => write!(f, "FailedPermanently"),
            Self::RolloutComplete => write!(f, "RolloutComplete"),
        }
    }
}

/// Rollout progress as reported in status and audit events
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RolloutStatus {
    /// Nothing known yet
    #[default]
    Unknown,
    /// Resources applied, workload not yet ready
    Initialized,
    /// Workload finished rolling out
    Complete,
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Initialized => write!(f, "initialized"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Persisted synchronization status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_state: Option<SynchronizationState>,

    /// Hash of the last executed spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_hash: Option<String>,

    /// Correlation id of the last rollout
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,

    /// When the state last changed, in nanoseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_time: Option<i64>,

    /// When the last rollout completed, in nanoseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_complete_time: Option<i64>,

    /// Progress of the last rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_rollout_status: Option<RolloutStatus>,

    /// Human-readable detail for failure states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
