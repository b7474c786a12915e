//! A reconcilable workload object of either kind

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};

use super::application::KeelApplication;
use super::container::ContainerSpec;
use super::job::KeelJob;
use super::status::SyncStatus;
use crate::CORRELATION_ID_ANNOTATION;

/// The two Source kinds Keel reconciles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    /// [`KeelApplication`]
    Application,
    /// [`KeelJob`]
    Job,
}

impl SourceKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "KeelApplication",
            Self::Job => "KeelJob",
        }
    }

    /// Kind of workload object the Source rolls out
    pub fn workload_kind(&self) -> WorkloadKind {
        match self {
            Self::Application => WorkloadKind::Deployment,
            Self::Job => WorkloadKind::Job,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload object whose readiness marks a rollout as complete
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// batch/v1 Job
    Job,
}

impl WorkloadKind {
    /// API resource for this workload type
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::Job => ApiResource::erase::<Job>(&()),
        }
    }
}

/// Identity of a Source: kind, namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    /// Source kind
    pub kind: SourceKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl SourceKey {
    /// Create a new key
    pub fn new(kind: SourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A KeelApplication or a KeelJob
#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    /// Long-running workload
    Application(KeelApplication),
    /// Batch workload
    Job(KeelJob),
}

impl From<KeelApplication> for Source {
    fn from(app: KeelApplication) -> Self {
        Self::Application(app)
    }
}

impl From<KeelJob> for Source {
    fn from(job: KeelJob) -> Self {
        Self::Job(job)
    }
}

impl Source {
    /// Which kind of Source this is
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Application(_) => SourceKind::Application,
            Self::Job(_) => SourceKind::Job,
        }
    }

    /// Workload kind this Source rolls out
    pub fn workload_kind(&self) -> WorkloadKind {
        self.kind().workload_kind()
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Application(app) => app.meta(),
            Self::Job(job) => job.meta(),
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Application(app) => app.meta_mut(),
            Self::Job(job) => job.meta_mut(),
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Application(app) => app.name_any(),
            Self::Job(job) => job.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    /// Identity key, if the object is namespaced
    pub fn key(&self) -> Option<SourceKey> {
        self.namespace()
            .map(|ns| SourceKey::new(self.kind(), ns, self.name()))
    }

    /// Object UID
    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    /// Object resourceVersion
    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    /// Annotation value by key
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Labels, empty when unset
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    /// Correlation id annotation, if present and non-empty
    pub fn correlation_id(&self) -> Option<&str> {
        self.annotation(CORRELATION_ID_ANNOTATION)
            .filter(|id| !id.is_empty())
    }

    /// Status sub-document
    pub fn status(&self) -> Option<&SyncStatus> {
        match self {
            Self::Application(app) => app.status.as_ref(),
            Self::Job(job) => job.status.as_ref(),
        }
    }

    /// Hash stored by the last executed rollout
    pub fn synchronization_hash(&self) -> Option<&str> {
        self.status()
            .and_then(|s| s.synchronization_hash.as_deref())
    }

    /// Main container
    pub fn container(&self) -> &ContainerSpec {
        match self {
            Self::Application(app) => &app.spec.container,
            Self::Job(job) => &job.spec.container,
        }
    }

    /// Mutable main container
    pub fn container_mut(&mut self) -> &mut ContainerSpec {
        match self {
            Self::Application(app) => &mut app.spec.container,
            Self::Job(job) => &mut job.spec.container,
        }
    }

    /// The spec as JSON
    pub fn spec_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Application(app) => serde_json::to_value(&app.spec),
            Self::Job(job) => serde_json::to_value(&job.spec),
        }
    }

    /// Reference used when recording events on this object
    pub fn object_ref(&self) -> ObjectReference {
        match self {
            Self::Application(app) => app.object_ref(&()),
            Self::Job(job) => job.object_ref(&()),
        }
    }

    /// Controller owner reference pointing at this object
    ///
    /// `None` until the object has been persisted and carries a UID.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        match self {
            Self::Application(app) => app.controller_owner_ref(&()),
            Self::Job(job) => job.controller_owner_ref(&()),
        }
    }
}
