//! Operation executor
//!
//! Applies a rollout's operations strictly in order, then deletes objects the
//! Source owns that the rollout no longer produces. The executor keeps no
//! state between calls; everything it needs is on the operation or in the
//! store.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use keel_common::crd::Source;
use keel_common::kube_utils::{fill_missing, set_json_pointer};
use keel_common::{
    APP_LABEL, DELETION_POLICY_ABANDON, DELETION_POLICY_ANNOTATION, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, STATE_INTO_SPEC_ANNOTATION, STATE_INTO_SPEC_MERGE,
};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::compiler::{Operation, OperationKind, OperationTarget};
use crate::error::ExecuteError;
use crate::rollout::Rollout;
use crate::store::{ClusterStore, StoreError};

/// Fields the API server refuses to change (or assigns itself), by group and kind.
///
/// Values are JSON pointers into the object body.
const IMMUTABLE_FIELDS: &[(&str, &str, &[&str])] = &[
    ("", "Service", &["/spec/clusterIP", "/spec/clusterIPs"]),
    ("apps", "Deployment", &["/spec/selector"]),
    ("", "ServiceAccount", &["/secrets"]),
    (
        "",
        "PersistentVolumeClaim",
        &["/spec/volumeName", "/spec/storageClassName"],
    ),
    ("sql.cnrm.cloud.google.com", "SQLInstance", &["/spec/resourceID"]),
];

fn immutable_fields(ar: &ApiResource) -> &'static [&'static str] {
    IMMUTABLE_FIELDS
        .iter()
        .find(|(group, kind, _)| *group == ar.group && *kind == ar.kind)
        .map(|(_, _, fields)| *fields)
        .unwrap_or(&[])
}

/// Kinds swept for orphans after every rollout
pub fn tracked_kinds() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<ServiceAccount>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<Deployment>(&()),
        ApiResource::erase::<HorizontalPodAutoscaler>(&()),
        ApiResource::erase::<Job>(&()),
    ]
}

/// Build the object to write over `live` for a CreateOrUpdate.
///
/// Desired content wins, except for:
/// - resourceVersion, taken from `live` so a concurrent write surfaces as a conflict
/// - finalizers, annotations, labels and non-controller owners others added
/// - immutable fields of the kind
/// - with `keel.dev/state-into-spec: merge` on `live`, any spec field desired omits
pub fn merge_live(ar: &ApiResource, desired: &DynamicObject, live: &DynamicObject) -> DynamicObject {
    let mut merged = desired.clone();
    let meta = &mut merged.metadata;

    meta.resource_version = live.metadata.resource_version.clone();
    if meta.finalizers.is_none() {
        meta.finalizers = live.metadata.finalizers.clone();
    }
    carry_foreign_entries(&mut meta.annotations, live.metadata.annotations.as_ref());
    carry_foreign_entries(&mut meta.labels, live.metadata.labels.as_ref());

    if let Some(live_owners) = &live.metadata.owner_references {
        let owners = meta.owner_references.get_or_insert_with(Vec::new);
        for owner in live_owners {
            let foreign = owner.controller != Some(true) && !owners.iter().any(|o| o.uid == owner.uid);
            if foreign {
                owners.push(owner.clone());
            }
        }
    }

    for pointer in immutable_fields(ar) {
        if let Some(value) = live.data.pointer(pointer) {
            set_json_pointer(&mut merged.data, pointer, value.clone());
        }
    }

    let merge_state = live
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(STATE_INTO_SPEC_ANNOTATION))
        .is_some_and(|v| v == STATE_INTO_SPEC_MERGE);
    if merge_state {
        if let (Some(live_spec), Some(body)) = (live.data.get("spec"), merged.data.as_object_mut()) {
            let spec = body
                .entry("spec")
                .or_insert_with(|| Value::Object(Default::default()));
            fill_missing(spec, live_spec);
        }
    }

    merged
}

fn carry_foreign_entries(
    desired: &mut Option<BTreeMap<String, String>>,
    live: Option<&BTreeMap<String, String>>,
) {
    let Some(live) = live else {
        return;
    };
    let desired = desired.get_or_insert_with(BTreeMap::new);
    for (key, value) in live {
        desired.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn is_owned_by(obj: &DynamicObject, uid: &str) -> bool {
    obj.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.uid == uid))
}

fn is_abandoned(obj: &DynamicObject) -> bool {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DELETION_POLICY_ANNOTATION))
        .is_some_and(|v| v == DELETION_POLICY_ABANDON)
}

/// What one execution did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Operations applied
    pub applied: usize,
    /// Orphans deleted
    pub orphans_deleted: usize,
}

/// Applies operations against a [`ClusterStore`]
pub struct Executor<'a> {
    store: &'a dyn ClusterStore,
}

impl<'a> Executor<'a> {
    /// Executor over a store
    pub fn new(store: &'a dyn ClusterStore) -> Self {
        Self { store }
    }

    /// Apply every operation in order, then collect orphans
    pub async fn execute(&self, rollout: &Rollout) -> Result<ExecutionReport, ExecuteError> {
        for op in &rollout.operations {
            self.apply(op).await?;
        }
        let orphans_deleted = self
            .collect_orphans(&rollout.source, &rollout.operations)
            .await?;
        Ok(ExecutionReport {
            applied: rollout.operations.len(),
            orphans_deleted,
        })
    }

    /// Apply a single operation
    #[instrument(
        skip(self, op),
        fields(operation = %op.kind, kind = %op.api_resource.kind, name = %op.name())
    )]
    pub async fn apply(&self, op: &Operation) -> Result<(), ExecuteError> {
        let ar = &op.api_resource;
        let name = op.name();
        let wrap = |source: StoreError| ExecuteError::Store {
            operation: op.kind,
            kind: ar.kind.clone(),
            name: name.to_string(),
            source,
        };
        let namespace = op
            .namespace()
            .ok_or_else(|| wrap(StoreError::Invalid("target has no namespace".to_string())))?;

        match op.kind {
            OperationKind::CreateOrUpdate => {
                match self
                    .store
                    .get(ar, Some(namespace), name)
                    .await
                    .map_err(wrap)?
                {
                    None => {
                        self.store.create(ar, &op.resource).await.map_err(wrap)?;
                        debug!("created");
                    }
                    Some(live) => {
                        let merged = merge_live(ar, &op.resource, &live);
                        self.store.replace(ar, &merged).await.map_err(wrap)?;
                        debug!("updated");
                    }
                }
            }
            OperationKind::CreateIfNotExists => match self.store.create(ar, &op.resource).await {
                Ok(_) => debug!("created"),
                Err(StoreError::AlreadyExists(_)) => debug!("already exists"),
                Err(e) => return Err(wrap(e)),
            },
            OperationKind::CreateOrRecreate => {
                match self.store.delete(ar, namespace, name).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(wrap(e)),
                }
                self.store.create(ar, &op.resource).await.map_err(wrap)?;
                debug!("recreated");
            }
            OperationKind::DeleteIfExists => match self.store.delete(ar, namespace, name).await {
                Ok(()) => debug!("deleted"),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(wrap(e)),
            },
            OperationKind::AnnotateIfExists => {
                let annotations = op.resource.metadata.annotations.clone().unwrap_or_default();
                match self
                    .store
                    .merge_annotations(ar, namespace, name, &annotations)
                    .await
                {
                    Ok(()) => debug!("annotated"),
                    Err(StoreError::NotFound(_)) => debug!("absent, not annotated"),
                    Err(e) => return Err(wrap(e)),
                }
            }
        }
        Ok(())
    }

    /// Delete tracked objects owned by `source` that `current` no longer targets.
    ///
    /// Objects annotated `keel.dev/deletion-policy: abandon` are kept.
    pub async fn collect_orphans(
        &self,
        source: &Source,
        current: &[Operation],
    ) -> Result<usize, ExecuteError> {
        let (Some(uid), Some(namespace)) = (source.uid(), source.namespace()) else {
            return Ok(0);
        };
        let name = source.name();
        let selector = format!(
            "{}={},{}={}",
            APP_LABEL, name, MANAGED_BY_LABEL, MANAGED_BY_VALUE
        );
        let keep: HashSet<OperationTarget> = current.iter().map(Operation::target).collect();

        let mut deleted = 0;
        for ar in tracked_kinds() {
            let sweep = |source: StoreError| ExecuteError::Sweep {
                kind: ar.kind.clone(),
                source,
            };
            let candidates = self
                .store
                .list(&ar, &namespace, &selector)
                .await
                .map_err(sweep)?;

            for obj in candidates {
                let Some(obj_name) = obj.metadata.name.clone() else {
                    continue;
                };
                if !is_owned_by(&obj, uid) {
                    continue;
                }
                let target = OperationTarget {
                    group: ar.group.clone(),
                    kind: ar.kind.clone(),
                    namespace: Some(namespace.clone()),
                    name: obj_name.clone(),
                };
                if keep.contains(&target) {
                    continue;
                }
                if is_abandoned(&obj) {
                    debug!(kind = %ar.kind, name = %obj_name, "orphan abandoned by policy");
                    continue;
                }

                match self.store.delete(&ar, &namespace, &obj_name).await {
                    Ok(()) => {
                        info!(kind = %ar.kind, name = %obj_name, source = %name, "deleted orphan");
                        deleted += 1;
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(sweep(e)),
                }
            }
        }
        Ok(deleted)
    }
}
