//! Custom Resource Definitions for Keel
//!
//! - [`KeelApplication`]: a long-running workload backed by a Deployment
//! - [`KeelJob`]: a run-to-completion workload backed by a batch Job
//!
//! Both share [`ContainerSpec`] and report progress through [`SyncStatus`].
//! [`Source`] lets the engine handle either kind through one type.

mod application;
mod container;
mod job;
mod source;
mod status;

pub use application::{KeelApplication, KeelApplicationSpec, ReplicasSpec};
pub use container::{ContainerSpec, EnvVar, ResourceList, ResourceRequirements};
pub use job::{KeelJob, KeelJobSpec};
pub use source::{Source, SourceKey, SourceKind, WorkloadKind};
pub use status::{RolloutStatus, SyncStatus, SynchronizationState};
