//! Core generators
//!
//! Generators run in two phases. Feature generators fill the [`Ast`] side
//! channels; workload generators run last and build the pod from them.
//!
//! Feature phase:
//! 1. `project-env` - platform env vars
//! 2. `secret-refs` - envFrom sources and Secret back-references
//! 3. `service-account`
//! 4. `service` (applications)
//! 5. `autoscaler` (applications)
//!
//! Workload phase:
//! 1. `deployment` (applications)
//! 2. `job` (jobs)

mod autoscaler;
mod deployment;
mod job;
mod project_env;
mod secret_refs;
mod service;
mod service_account;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use keel_common::crd::{KeelApplication, ReplicasSpec, ResourceList};

pub use autoscaler::AutoscalerGenerator;
pub use deployment::DeploymentGenerator;
pub use job::JobGenerator;
pub use project_env::ProjectEnvGenerator;
pub use secret_refs::SecretRefsGenerator;
pub use service::ServiceGenerator;
pub use service_account::ServiceAccountGenerator;

use super::{Ast, CompilationContext, Generator};
use crate::normalize::{
    DEFAULT_CPU_THRESHOLD, DEFAULT_MAX_REPLICAS, DEFAULT_MIN_REPLICAS, DEFAULT_PORT,
};

/// Core feature generators in their standard order
pub fn feature_generators() -> Vec<Box<dyn Generator>> {
    vec![
        Box::new(ProjectEnvGenerator),
        Box::new(SecretRefsGenerator),
        Box::new(ServiceAccountGenerator),
        Box::new(ServiceGenerator),
        Box::new(AutoscalerGenerator),
    ]
}

/// Generators that consume the side channels and emit the workload
pub fn workload_generators() -> Vec<Box<dyn Generator>> {
    vec![Box::new(DeploymentGenerator), Box::new(JobGenerator)]
}

// =============================================================================
// Shared building blocks
// =============================================================================

fn replicas(app: &KeelApplication) -> ReplicasSpec {
    app.spec.replicas.clone().unwrap_or(ReplicasSpec {
        min: DEFAULT_MIN_REPLICAS,
        max: DEFAULT_MAX_REPLICAS,
        cpu_threshold_percentage: DEFAULT_CPU_THRESHOLD,
    })
}

fn port(app: &KeelApplication) -> i32 {
    app.spec.port.unwrap_or(DEFAULT_PORT)
}

/// Whether an autoscaler owns the replica count of this application
fn autoscaling_active(ctx: &CompilationContext<'_>, app: &KeelApplication) -> bool {
    let replicas = replicas(app);
    ctx.options.features.autoscaling && replicas.max > replicas.min
}

fn quantities(list: Option<&ResourceList>) -> Option<BTreeMap<String, Quantity>> {
    let list = list?;
    let mut out = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!out.is_empty()).then_some(out)
}

/// The main container, merged with the Ast's env side channels
fn main_container(ctx: &CompilationContext<'_>, ast: &Ast, port: Option<i32>) -> Container {
    let spec = ctx.source.container();

    // Platform vars first; a user var of the same name replaces it
    let mut env: Vec<EnvVar> = ast
        .env
        .iter()
        .filter(|var| !spec.env.iter().any(|user| user.name == var.name))
        .cloned()
        .collect();
    env.extend(spec.env.iter().map(|var| EnvVar {
        name: var.name.clone(),
        value: Some(var.value.clone()),
        ..Default::default()
    }));

    let resources = spec.resources.as_ref().map(|r| ResourceRequirements {
        requests: quantities(r.requests.as_ref()),
        limits: quantities(r.limits.as_ref()),
        ..Default::default()
    });

    Container {
        name: ctx.name.to_string(),
        image: Some(spec.image.clone()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        ports: port.map(|p| {
            vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: p,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]
        }),
        env: (!env.is_empty()).then_some(env),
        env_from: (!ast.env_from.is_empty()).then(|| ast.env_from.clone()),
        resources,
        ..Default::default()
    }
}

/// Pod spec with the main container followed by side-channel containers
fn pod_spec(
    ctx: &CompilationContext<'_>,
    ast: &Ast,
    port: Option<i32>,
    restart_policy: &str,
) -> PodSpec {
    let mut containers = vec![main_container(ctx, ast, port)];
    containers.extend(ast.containers.iter().cloned());
    PodSpec {
        containers,
        service_account_name: Some(ctx.name.to_string()),
        restart_policy: Some(restart_policy.to_string()),
        ..Default::default()
    }
}
