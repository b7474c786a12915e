//! Resource synthesis and reconciliation engine for Keel workloads
//!
//! A watch event flows through:
//! - [`normalize`]: defaults plus a content hash used as the no-op fast path
//! - [`compiler`]: ordered generators turn a normalized Source into [`compiler::Operation`]s
//! - [`executor`]: operations are applied in order, then orphans are collected
//! - [`controller`]: the per-object state machine and status persistence
//! - [`monitor`]: a cancellable watcher that reports rollout completion
//! - [`audit`]: correlation ids, image references and the audit event

pub mod audit;
pub mod compiler;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod normalize;
pub mod options;
pub mod rollout;
pub mod sources;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{Context, ControllerConfig, ReconcileOutcome};
pub use error::{ErrorKind, ExecuteError, ReconcileError};
pub use monitor::{MonitorConfig, MonitorRegistry};
pub use options::{Features, Options};
pub use rollout::Rollout;
