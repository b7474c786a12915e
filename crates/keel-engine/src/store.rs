//! Cluster store abstraction
//!
//! The compiler reads through [`StoreReader`], the executor writes through
//! [`ClusterStore`]. [`KubeStore`] backs both with the Kubernetes API; tests
//! use an in-memory implementation with the same resourceVersion semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use thiserror::Error;

use crate::error::ErrorKind;

/// Failure talking to the cluster store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Create raced with another writer
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic concurrency check failed
    #[error("conflict: {0}")]
    Conflict(String),
    /// The API server rejected the object
    #[error("invalid: {0}")]
    Invalid(String),
    /// RBAC denied the call
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Network failure, timeout, throttling or server error
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// A response could not be decoded or a request encoded
    #[error("serialization: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient or permanent
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) | Self::Serialization(_) => ErrorKind::Permanent,
            Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::Conflict(_)
            | Self::Forbidden(_)
            | Self::Unavailable(_) => ErrorKind::Transient,
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => Self::AlreadyExists(ae.message),
                409 => Self::Conflict(ae.message),
                400 | 422 => Self::Invalid(ae.message),
                401 | 403 => Self::Forbidden(ae.message),
                _ => Self::Unavailable(format!("{} ({})", ae.message, ae.code)),
            },
            kube::Error::SerdeError(e) => Self::Serialization(e.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Read and write access to the objects Keel manages
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch an object; `None` when it does not exist
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// List objects in a namespace matching a label selector
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Create an object in its own namespace
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject, StoreError>;

    /// Replace an object; its resourceVersion must match the live one
    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Merge-patch annotations onto an existing object
    async fn merge_annotations(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Delete an object
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str)
        -> Result<(), StoreError>;
}

/// Read-only view of a [`ClusterStore`] handed to generators
#[derive(Clone, Copy)]
pub struct StoreReader<'a> {
    store: &'a dyn ClusterStore,
}

impl<'a> StoreReader<'a> {
    /// Wrap a store
    pub fn new(store: &'a dyn ClusterStore) -> Self {
        Self { store }
    }

    /// Fetch an object; `None` when it does not exist
    pub async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.store.get(ar, namespace, name).await
    }

    /// List objects in a namespace matching a label selector
    pub async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        self.store.list(ar, namespace, label_selector).await
    }
}

/// [`ClusterStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.api(ar, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let list = self
            .api(ar, Some(namespace))
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        Ok(self
            .api(ar, obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::Invalid(format!("{} without a name", ar.kind)))?;
        Ok(self
            .api(ar, obj.metadata.namespace.as_deref())
            .replace(name, &PostParams::default(), obj)
            .await?)
    }

    async fn merge_annotations(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.api(ar, Some(namespace))
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.api(ar, Some(namespace))
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}
