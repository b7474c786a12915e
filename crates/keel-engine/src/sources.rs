//! Access to KeelApplication and KeelJob objects
//!
//! The controller and the rollout monitor read Sources and persist their
//! status through [`SourceClient`]. Status writes carry the resourceVersion
//! the caller last saw; a stale one fails with [`StoreError::Conflict`].

use async_trait::async_trait;
use keel_common::crd::{KeelApplication, KeelJob, Source, SourceKey, SourceKind, SyncStatus};
use keel_common::CORRELATION_ID_ANNOTATION;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};

use crate::store::StoreError;

/// Status fields written on every update; unset ones are cleared
const STATUS_FIELDS: &[&str] = &[
    "synchronizationState",
    "synchronizationHash",
    "correlationID",
    "synchronizationTime",
    "rolloutCompleteTime",
    "deploymentRolloutStatus",
    "message",
];

/// Read Sources and write their annotations and status
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Latest version of a Source; `None` once deleted
    async fn get(&self, key: &SourceKey) -> Result<Option<Source>, StoreError>;

    /// Store the correlation id annotation and return the updated Source
    async fn set_correlation_id(&self, key: &SourceKey, id: &str) -> Result<Source, StoreError>;

    /// Replace the status sub-resource
    ///
    /// With `resource_version` set the write fails with a conflict when the
    /// Source changed since it was read.
    async fn update_status(
        &self,
        key: &SourceKey,
        resource_version: Option<&str>,
        status: &SyncStatus,
    ) -> Result<Source, StoreError>;
}

/// Merge patch body that replaces every status field
pub fn status_patch(resource_version: Option<&str>, status: &SyncStatus) -> Result<Value, StoreError> {
    let mut body = serde_json::to_value(status).map_err(|e| StoreError::Serialization(e.to_string()))?;
    if let Some(fields) = body.as_object_mut() {
        for field in STATUS_FIELDS {
            fields.entry(*field).or_insert(Value::Null);
        }
    }
    let mut patch = json!({ "status": body });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

/// [`SourceClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSourceClient {
    client: Client,
}

impl KubeSourceClient {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch(&self, key: &SourceKey, patch: &Value, status: bool) -> Result<Source, StoreError> {
        let params = PatchParams::default();
        let patch = Patch::Merge(patch);
        let source: Source = match key.kind {
            SourceKind::Application => {
                let api: Api<KeelApplication> = Api::namespaced(self.client.clone(), &key.namespace);
                if status {
                    api.patch_status(&key.name, &params, &patch).await?.into()
                } else {
                    api.patch(&key.name, &params, &patch).await?.into()
                }
            }
            SourceKind::Job => {
                let api: Api<KeelJob> = Api::namespaced(self.client.clone(), &key.namespace);
                if status {
                    api.patch_status(&key.name, &params, &patch).await?.into()
                } else {
                    api.patch(&key.name, &params, &patch).await?.into()
                }
            }
        };
        Ok(source)
    }
}

#[async_trait]
impl SourceClient for KubeSourceClient {
    async fn get(&self, key: &SourceKey) -> Result<Option<Source>, StoreError> {
        let source = match key.kind {
            SourceKind::Application => {
                Api::<KeelApplication>::namespaced(self.client.clone(), &key.namespace)
                    .get_opt(&key.name)
                    .await?
                    .map(Source::from)
            }
            SourceKind::Job => Api::<KeelJob>::namespaced(self.client.clone(), &key.namespace)
                .get_opt(&key.name)
                .await?
                .map(Source::from),
        };
        Ok(source)
    }

    async fn set_correlation_id(&self, key: &SourceKey, id: &str) -> Result<Source, StoreError> {
        let patch = json!({
            "metadata": { "annotations": { (CORRELATION_ID_ANNOTATION): id } }
        });
        self.patch(key, &patch, false).await
    }

    async fn update_status(
        &self,
        key: &SourceKey,
        resource_version: Option<&str>,
        status: &SyncStatus,
    ) -> Result<Source, StoreError> {
        let patch = status_patch(resource_version, status)?;
        self.patch(key, &patch, true).await
    }
}
