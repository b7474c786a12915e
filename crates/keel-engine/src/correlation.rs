//! Correlation id generation
//!
//! The id ties together the status, events, logs and audit records of one
//! rollout. It is generated only when the Source does not already carry one.

use uuid::Uuid;

/// Source of new correlation ids
pub trait IdGenerator: Send + Sync {
    /// A new, unique id
    fn generate(&self) -> String;
}

/// Random v4 UUIDs
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
