//! Status transitions shared by the controller and the rollout monitor

use chrono::Utc;
use keel_common::crd::{RolloutStatus, Source, SyncStatus, SynchronizationState};

/// Current time in nanoseconds since the epoch
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// The Source's current status moved to `state`, stamped with the current time.
///
/// Fields the transition does not touch keep their previous values; the
/// message is cleared.
pub fn transition(source: &Source, state: SynchronizationState) -> SyncStatus {
    let mut status = source.status().cloned().unwrap_or_default();
    status.synchronization_state = Some(state);
    status.synchronization_time = Some(now_nanos());
    status.message = None;
    status
}

/// Status recorded once the workload finished rolling out
pub fn rollout_complete(source: &Source) -> SyncStatus {
    let mut status = transition(source, SynchronizationState::RolloutComplete);
    status.rollout_complete_time = status.synchronization_time;
    status.deployment_rollout_status = Some(RolloutStatus::Complete);
    status
}
