//! Environment configuration handed to every rollout
//!
//! [`Options`] is built once at startup. [`resolve_options`] specializes a copy
//! per rollout with the tenant project id.

use k8s_openapi::api::core::v1::Namespace;
use keel_common::crd::Source;
use keel_common::PROJECT_ID_ANNOTATION;
use kube::discovery::ApiResource;

use crate::compiler::CompileError;
use crate::store::StoreReader;

/// Cluster feature toggles
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Generate HorizontalPodAutoscalers for applications
    pub autoscaling: bool,
    /// Refuse to compile a Source without a project id
    pub require_project_id: bool,
}

/// Environment configuration for a rollout
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Name of the cluster this operator runs in
    pub cluster_name: String,
    /// Feature toggles
    pub features: Features,
    /// Per-tenant project identifier, resolved per rollout
    pub project_id: Option<String>,
}

impl Options {
    /// Create options for a cluster with default features
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// Copy specialized with a resolved project id
    pub fn for_rollout(&self, project_id: Option<String>) -> Self {
        Self {
            project_id,
            ..self.clone()
        }
    }
}

/// Resolve the project id from the Source, falling back to its Namespace
pub async fn resolve_options(
    base: &Options,
    source: &Source,
    store: StoreReader<'_>,
) -> Result<Options, CompileError> {
    let mut project_id = source
        .annotation(PROJECT_ID_ANNOTATION)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    if project_id.is_none() {
        if let Some(namespace) = source.namespace() {
            let ns = store
                .get(&ApiResource::erase::<Namespace>(&()), None, &namespace)
                .await
                .map_err(|err| CompileError::Lookup {
                    what: format!("namespace {}", namespace),
                    source: err,
                })?;
            project_id = ns.and_then(|ns| {
                ns.metadata
                    .annotations
                    .and_then(|mut a| a.remove(PROJECT_ID_ANNOTATION))
                    .filter(|id| !id.is_empty())
            });
        }
    }

    if project_id.is_none() && base.features.require_project_id {
        return Err(CompileError::MissingProjectId(source.name()));
    }

    Ok(base.for_rollout(project_id))
}
