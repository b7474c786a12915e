//! In-memory fakes and sample objects shared by the engine's tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference};
use keel_common::crd::{
    ContainerSpec, KeelApplication, KeelApplicationSpec, KeelJob, KeelJobSpec, Source, SourceKey,
    SyncStatus, SynchronizationState,
};
use keel_common::events::EventPublisher;
use keel_common::{Error, CORRELATION_ID_ANNOTATION, PROJECT_ID_ANNOTATION};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::events::EventType;
use mockall::mock;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::correlation::IdGenerator;
use crate::normalize::normalize_and_hash;
use crate::options::Options;
use crate::rollout::Rollout;
use crate::sources::SourceClient;
use crate::store::{ClusterStore, StoreError};

// =============================================================================
// Sample objects
// =============================================================================

fn container(image: &str) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        ..Default::default()
    }
}

/// A persisted KeelApplication with uid `uid-<name>`
pub fn sample_app(name: &str, namespace: &str, image: &str) -> Source {
    let mut app = KeelApplication::new(
        name,
        KeelApplicationSpec {
            container: container(image),
            ..Default::default()
        },
    );
    app.metadata.namespace = Some(namespace.to_string());
    app.metadata.uid = Some(format!("uid-{name}"));
    app.into()
}

/// A persisted KeelJob with uid `uid-<name>`
pub fn sample_job(name: &str, namespace: &str, image: &str) -> Source {
    let mut job = KeelJob::new(
        name,
        KeelJobSpec {
            container: container(image),
            ..Default::default()
        },
    );
    job.metadata.namespace = Some(namespace.to_string());
    job.metadata.uid = Some(format!("uid-{name}"));
    job.into()
}

/// A rollout of a normalized sample application with no operations
pub fn sample_rollout(name: &str, namespace: &str, image: &str) -> Rollout {
    let (source, hash) = normalize_and_hash(&sample_app(name, namespace, image)).unwrap();
    let key = source.key().unwrap();
    Rollout::new(
        key,
        source,
        Options::new("dev"),
        Vec::new(),
        format!("corr-{name}"),
        hash,
    )
    .unwrap()
}

/// Decode a JSON manifest
pub fn dynamic(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

// =============================================================================
// MemoryStore
// =============================================================================

type ObjectKey = (String, String, String, String);

fn object_key(ar: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        ar.group.clone(),
        ar.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// [`ClusterStore`] over a map, with resourceVersion checks and failure injection
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
    fail_create: Mutex<Option<StoreError>>,
    fail_replace: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, obj: &mut DynamicObject) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(version.to_string());
    }

    /// Seed an object without counting a write
    pub fn insert(&self, ar: &ApiResource, mut obj: DynamicObject) {
        self.bump(&mut obj);
        let key = object_key(
            ar,
            obj.metadata.namespace.as_deref(),
            obj.metadata.name.as_deref().unwrap_or_default(),
        );
        self.objects.lock().insert(key, obj);
    }

    /// Seed an object from a JSON manifest
    pub fn insert_raw(&self, ar: &ApiResource, value: Value) {
        self.insert(ar, dynamic(value));
    }

    /// Seed a Namespace, optionally carrying a project id
    pub fn insert_namespace(&self, name: &str, project_id: Option<&str>) {
        let mut annotations = serde_json::Map::new();
        if let Some(id) = project_id {
            annotations.insert(PROJECT_ID_ANNOTATION.to_string(), json!(id));
        }
        self.insert_raw(
            &ApiResource::erase::<Namespace>(&()),
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": name, "annotations": annotations}
            }),
        );
    }

    pub fn get_object(&self, ar: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .get(&object_key(ar, Some(namespace), name))
            .cloned()
    }

    /// Objects of one kind, in key order
    pub fn objects_of(&self, ar: &ApiResource) -> Vec<DynamicObject> {
        self.objects
            .lock()
            .iter()
            .filter(|((group, kind, _, _), _)| *group == ar.group && *kind == ar.kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Successful create, replace, annotate and delete calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_next_create(&self, err: StoreError) {
        *self.fail_create.lock() = Some(err);
    }

    pub fn fail_next_replace(&self, err: StoreError) {
        *self.fail_replace.lock() = Some(err);
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self
            .objects
            .lock()
            .get(&object_key(ar, namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((group, kind, ns, _), obj)| {
                *group == ar.group
                    && *kind == ar.kind
                    && ns == namespace
                    && matches_selector(obj, label_selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        if let Some(err) = self.fail_create.lock().take() {
            return Err(err);
        }
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = object_key(ar, obj.metadata.namespace.as_deref(), &name);
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(name));
        }
        let mut created = obj.clone();
        self.bump(&mut created);
        objects.insert(key, created.clone());
        self.wrote();
        Ok(created)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        if let Some(err) = self.fail_replace.lock().take() {
            return Err(err);
        }
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = object_key(ar, obj.metadata.namespace.as_deref(), &name);
        let mut objects = self.objects.lock();
        let Some(live) = objects.get(&key) else {
            return Err(StoreError::NotFound(name));
        };
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != live.metadata.resource_version
        {
            return Err(StoreError::Conflict(name));
        }
        let mut replaced = obj.clone();
        self.bump(&mut replaced);
        objects.insert(key, replaced.clone());
        self.wrote();
        Ok(replaced)
    }

    async fn merge_annotations(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        let Some(live) = objects.get_mut(&object_key(ar, Some(namespace), name)) else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        live.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        live.metadata.resource_version = Some(version.to_string());
        self.wrote();
        Ok(())
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .objects
            .lock()
            .remove(&object_key(ar, Some(namespace), name))
        {
            Some(_) => {
                self.wrote();
                Ok(())
            }
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }
}

// =============================================================================
// MemorySourceClient
// =============================================================================

/// [`SourceClient`] over a map, rejecting status writes with a stale resourceVersion
#[derive(Default)]
pub struct MemorySourceClient {
    sources: Mutex<HashMap<SourceKey, Source>>,
    next_version: AtomicU64,
    annotation_writes: AtomicUsize,
    states: Mutex<Vec<Option<SynchronizationState>>>,
    fail_status: Mutex<Option<StoreError>>,
}

impl MemorySourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, source: &mut Source) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        source.meta_mut().resource_version = Some(version.to_string());
    }

    /// Store or replace a Source, as a user edit would
    pub fn insert(&self, mut source: Source) {
        self.bump(&mut source);
        let key = source.key().unwrap();
        self.sources.lock().insert(key, source);
    }

    pub fn source(&self, key: &SourceKey) -> Option<Source> {
        self.sources.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &SourceKey) {
        self.sources.lock().remove(key);
    }

    pub fn status(&self, key: &SourceKey) -> SyncStatus {
        self.source(key)
            .and_then(|s| s.status().cloned())
            .unwrap_or_default()
    }

    /// States written, oldest first
    pub fn states(&self) -> Vec<Option<SynchronizationState>> {
        self.states.lock().clone()
    }

    pub fn status_writes(&self) -> usize {
        self.states.lock().len()
    }

    /// Status and annotation writes
    pub fn writes(&self) -> usize {
        self.status_writes() + self.annotation_writes.load(Ordering::SeqCst)
    }

    pub fn fail_next_status(&self, err: StoreError) {
        *self.fail_status.lock() = Some(err);
    }
}

#[async_trait]
impl SourceClient for MemorySourceClient {
    async fn get(&self, key: &SourceKey) -> Result<Option<Source>, StoreError> {
        Ok(self.source(key))
    }

    async fn set_correlation_id(&self, key: &SourceKey, id: &str) -> Result<Source, StoreError> {
        let mut sources = self.sources.lock();
        let source = sources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        source
            .meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CORRELATION_ID_ANNOTATION.to_string(), id.to_string());
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        source.meta_mut().resource_version = Some(version.to_string());
        self.annotation_writes.fetch_add(1, Ordering::SeqCst);
        Ok(source.clone())
    }

    async fn update_status(
        &self,
        key: &SourceKey,
        resource_version: Option<&str>,
        status: &SyncStatus,
    ) -> Result<Source, StoreError> {
        if let Some(err) = self.fail_status.lock().take() {
            return Err(err);
        }
        let mut sources = self.sources.lock();
        let source = sources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if resource_version.is_some() && resource_version != source.resource_version() {
            return Err(StoreError::Conflict(key.to_string()));
        }
        match source {
            Source::Application(app) => app.status = Some(status.clone()),
            Source::Job(job) => job.status = Some(status.clone()),
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        source.meta_mut().resource_version = Some(version.to_string());
        self.states.lock().push(status.synchronization_state);
        Ok(source.clone())
    }
}

// =============================================================================
// Events and ids
// =============================================================================

mock! {
    pub Events {}

    #[async_trait]
    impl EventPublisher for Events {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            action: &str,
            note: Option<String>,
        ) -> Result<(), Error>;
    }
}

/// What the API server returns when it cannot take the event
fn unavailable() -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "etcdserver: request timed out".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

/// Records published event reasons; can be told to fail
#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(bool, String)>>,
    failures: AtomicUsize,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Reasons of successfully published events, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.published.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Reasons of published Warning events
    pub fn warnings(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(warning, _)| *warning)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) -> Result<(), Error> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(unavailable());
        }
        self.published
            .lock()
            .push((matches!(type_, EventType::Warning), reason.to_string()));
        Ok(())
    }
}

/// Ids `corr-1`, `corr-2`, ...
#[derive(Default)]
pub struct SequenceIds {
    next: AtomicUsize,
}

impl IdGenerator for SequenceIds {
    fn generate(&self) -> String {
        format!("corr-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
