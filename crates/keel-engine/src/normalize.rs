//! Spec normalization and content hashing
//!
//! [`normalize`] fills defaults and sorts order-insensitive lists so that two
//! specs meaning the same thing serialize the same way. [`spec_hash`] then
//! hashes `{kind, spec, labels}` as canonical JSON. Annotations (including the
//! correlation id) and status never contribute to the hash.

use std::collections::BTreeMap;

use keel_common::crd::{
    ContainerSpec, ReplicasSpec, ResourceList, ResourceRequirements, Source,
};
use keel_common::kube_utils::{canonical_json, deterministic_hash};
use thiserror::Error;

/// Default container port for applications
pub const DEFAULT_PORT: i32 = 8080;
/// Default minimum replicas for applications
pub const DEFAULT_MIN_REPLICAS: i32 = 2;
/// Default maximum replicas for applications
pub const DEFAULT_MAX_REPLICAS: i32 = 4;
/// Default CPU target for the autoscaler
pub const DEFAULT_CPU_THRESHOLD: i32 = 50;
/// Default retries for jobs
pub const DEFAULT_BACKOFF_LIMIT: i32 = 6;
/// Default retention of finished jobs (one day)
pub const DEFAULT_TTL_SECONDS_AFTER_FINISHED: i32 = 86_400;

/// A spec that cannot be normalized; fixing it requires a user edit
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// No image given
    #[error("spec.image must not be empty")]
    EmptyImage,
    /// An env var name is empty or not a valid identifier
    #[error("invalid environment variable name {0:?}")]
    InvalidEnvName(String),
    /// Replica bounds out of range
    #[error("invalid replicas: min={min} max={max}")]
    InvalidReplicas {
        /// Requested minimum
        min: i32,
        /// Requested maximum
        max: i32,
    },
    /// Port out of range
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(i32),
    /// CPU target out of range
    #[error("cpuThresholdPercentage {0} is outside 1..=100")]
    InvalidCpuThreshold(i32),
    /// The spec could not be serialized for hashing
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Apply defaults and canonical ordering to a Source
pub fn normalize(source: &Source) -> Result<Source, NormalizeError> {
    let mut normalized = source.clone();
    normalize_container(normalized.container_mut())?;

    match &mut normalized {
        Source::Application(app) => {
            let port = *app.spec.port.get_or_insert(DEFAULT_PORT);
            if !(1..=65535).contains(&port) {
                return Err(NormalizeError::InvalidPort(port));
            }

            let replicas = app.spec.replicas.get_or_insert_with(|| ReplicasSpec {
                min: DEFAULT_MIN_REPLICAS,
                max: DEFAULT_MAX_REPLICAS,
                cpu_threshold_percentage: DEFAULT_CPU_THRESHOLD,
            });
            if replicas.min < 0 || replicas.max < 1 {
                return Err(NormalizeError::InvalidReplicas {
                    min: replicas.min,
                    max: replicas.max,
                });
            }
            if replicas.max < replicas.min {
                replicas.max = replicas.min;
            }
            if !(1..=100).contains(&replicas.cpu_threshold_percentage) {
                return Err(NormalizeError::InvalidCpuThreshold(
                    replicas.cpu_threshold_percentage,
                ));
            }
        }
        Source::Job(job) => {
            job.spec.backoff_limit.get_or_insert(DEFAULT_BACKOFF_LIMIT);
            job.spec
                .ttl_seconds_after_finished
                .get_or_insert(DEFAULT_TTL_SECONDS_AFTER_FINISHED);
        }
    }

    Ok(normalized)
}

fn normalize_container(container: &mut ContainerSpec) -> Result<(), NormalizeError> {
    if container.image.trim().is_empty() {
        return Err(NormalizeError::EmptyImage);
    }

    // Later definitions of the same name win
    let mut env = BTreeMap::new();
    for var in container.env.drain(..) {
        if !is_valid_env_name(&var.name) {
            return Err(NormalizeError::InvalidEnvName(var.name));
        }
        env.insert(var.name.clone(), var);
    }
    container.env = env.into_values().collect();

    container.env_from_secrets.sort();
    container.env_from_secrets.dedup();

    let resources = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    let requests = resources.requests.get_or_insert_with(ResourceList::default);
    requests.cpu.get_or_insert_with(|| "200m".to_string());
    requests.memory.get_or_insert_with(|| "256Mi".to_string());
    let limits = resources.limits.get_or_insert_with(ResourceList::default);
    limits.memory.get_or_insert_with(|| "512Mi".to_string());

    Ok(())
}

/// Env var names accepted by the kubelet: `[-._a-zA-Z][-._a-zA-Z0-9]*`
fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || matches!(c, '-' | '.' | '_') => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Content hash of a normalized Source
pub fn spec_hash(source: &Source) -> Result<String, NormalizeError> {
    let spec = source
        .spec_value()
        .map_err(|e| NormalizeError::Serialization(e.to_string()))?;
    let document = serde_json::json!({
        "kind": source.kind().as_str(),
        "spec": spec,
        "labels": source.labels(),
    });
    Ok(deterministic_hash(&canonical_json(&document)))
}

/// Normalize and hash in one step
pub fn normalize_and_hash(source: &Source) -> Result<(Source, String), NormalizeError> {
    let normalized = normalize(source)?;
    let hash = spec_hash(&normalized)?;
    Ok((normalized, hash))
}
