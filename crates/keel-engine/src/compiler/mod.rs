//! Resource compiler
//!
//! [`ResourceCompiler::compile`] runs an ordered list of [`Generator`]s over a
//! normalized Source. Each generator appends [`Operation`]s (and side-channel
//! container fragments) to a shared [`Ast`]; the resulting operation list keeps
//! append order all the way through execution. Workload generators run last
//! so every container and env entry is in the Ast before the pod is built.
//!
//! After generation every create-style target is stamped with a controller
//! owner reference to the Source and the standard Keel labels. Orphan
//! collection relies on both.

mod generator;
pub mod generators;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvFromSource, EnvVar};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_common::crd::Source;
use keel_common::kube_utils::to_dynamic;
use keel_common::{APP_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub use generator::{CompilationContext, Generator, GeneratorError};

use crate::options::Options;
use crate::store::{StoreError, StoreReader};

// =============================================================================
// Operations
// =============================================================================

/// How the executor applies an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Create, or update the live object preserving immutable fields
    CreateOrUpdate,
    /// Create; an existing object is left untouched
    CreateIfNotExists,
    /// Delete then create
    CreateOrRecreate,
    /// Delete; a missing object is fine
    DeleteIfExists,
    /// Merge annotations onto the object if it exists
    AnnotateIfExists,
}

impl OperationKind {
    /// Whether the operation leaves an object Keel owns
    pub fn creates(&self) -> bool {
        matches!(
            self,
            Self::CreateOrUpdate | Self::CreateIfNotExists | Self::CreateOrRecreate
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateOrUpdate => write!(f, "CreateOrUpdate"),
            Self::CreateIfNotExists => write!(f, "CreateIfNotExists"),
            Self::CreateOrRecreate => write!(f, "CreateOrRecreate"),
            Self::DeleteIfExists => write!(f, "DeleteIfExists"),
            Self::AnnotateIfExists => write!(f, "AnnotateIfExists"),
        }
    }
}

/// Identity of the object an operation touches
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationTarget {
    /// API group ("" for core)
    pub group: String,
    /// Kind
    pub kind: String,
    /// Namespace
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

/// One desired-state change
#[derive(Clone, Debug)]
pub struct Operation {
    /// How to apply it
    pub kind: OperationKind,
    /// Type of the target
    pub api_resource: ApiResource,
    /// Desired object (for deletes, only its metadata matters)
    pub resource: DynamicObject,
}

impl Operation {
    /// Create from an untyped object
    pub fn new(kind: OperationKind, api_resource: ApiResource, resource: DynamicObject) -> Self {
        Self {
            kind,
            api_resource,
            resource,
        }
    }

    /// Create from a typed k8s-openapi object
    pub fn from_typed<K>(kind: OperationKind, obj: &K) -> Result<Self, GeneratorError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let (ar, resource) = to_dynamic(obj)?;
        Ok(Self::new(kind, ar, resource))
    }

    /// Target name
    pub fn name(&self) -> &str {
        self.resource.metadata.name.as_deref().unwrap_or_default()
    }

    /// Target namespace
    pub fn namespace(&self) -> Option<&str> {
        self.resource.metadata.namespace.as_deref()
    }

    /// Target identity
    pub fn target(&self) -> OperationTarget {
        OperationTarget {
            group: self.api_resource.group.clone(),
            kind: self.api_resource.kind.clone(),
            namespace: self.resource.metadata.namespace.clone(),
            name: self.name().to_string(),
        }
    }
}

// =============================================================================
// Ast
// =============================================================================

/// Compilation accumulator shared by all generators of one compile
#[derive(Debug, Default)]
pub struct Ast {
    /// Operations in append order
    pub operations: Vec<Operation>,
    /// Extra containers for the workload's pod
    pub containers: Vec<Container>,
    /// Extra env vars for the main container
    pub env: Vec<EnvVar>,
    /// Extra envFrom sources for the main container
    pub env_from: Vec<EnvFromSource>,
}

impl Ast {
    /// Append an operation
    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    /// Sizes of the side channels, used to detect writes after the workload is built
    fn side_channel_len(&self) -> (usize, usize, usize) {
        (self.containers.len(), self.env.len(), self.env_from.len())
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Failure to turn a Source into operations
#[derive(Debug, Error)]
pub enum CompileError {
    /// A generator failed
    #[error("generator {generator} failed: {source}")]
    Generator {
        /// Generator name
        generator: String,
        /// What went wrong
        #[source]
        source: GeneratorError,
    },

    /// A read-only lookup needed for compilation failed
    #[error("lookup of {what} failed: {source}")]
    Lookup {
        /// What was being looked up
        what: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// Project id is required on this cluster but none was found
    #[error("no project id found for {0} and the cluster requires one")]
    MissingProjectId(String),

    /// The Source has not been persisted yet
    #[error("{0} has no uid")]
    MissingUid(String),

    /// The Source is not namespaced
    #[error("{0} has no namespace")]
    MissingNamespace(String),

    /// A generator added containers or env after the workload was built
    #[error("generator {0} wrote pod side channels after the workload was built")]
    LateSideChannel(String),
}

/// Runs generators in two phases and stamps ownership on the result
///
/// Feature generators run first and may fill the [`Ast`] side channels.
/// Workload generators run last and turn those side channels into the pod.
pub struct ResourceCompiler {
    features: Vec<Box<dyn Generator>>,
    workloads: Vec<Box<dyn Generator>>,
}

impl ResourceCompiler {
    /// Compiler with explicit feature and workload generator lists
    pub fn new(features: Vec<Box<dyn Generator>>, workloads: Vec<Box<dyn Generator>>) -> Self {
        Self {
            features,
            workloads,
        }
    }

    /// Compiler with the core generators in their standard order
    pub fn with_core_generators() -> Self {
        Self::new(
            generators::feature_generators(),
            generators::workload_generators(),
        )
    }

    /// Add a feature generator; it runs after the existing feature generators
    /// and before any workload generator
    pub fn with_generator(mut self, generator: Box<dyn Generator>) -> Self {
        self.features.push(generator);
        self
    }

    /// Generator names in run order
    pub fn generator_names(&self) -> Vec<&str> {
        self.features
            .iter()
            .chain(&self.workloads)
            .map(|g| g.name())
            .collect()
    }

    /// Compile a normalized Source into an ordered operation list
    pub async fn compile(
        &self,
        source: &Source,
        options: &Options,
        store: StoreReader<'_>,
    ) -> Result<Vec<Operation>, CompileError> {
        let name = source.name();
        let namespace = source
            .namespace()
            .ok_or_else(|| CompileError::MissingNamespace(name.clone()))?;
        let owner = source
            .owner_reference()
            .ok_or_else(|| CompileError::MissingUid(name.clone()))?;

        let ctx = CompilationContext {
            source,
            name: &name,
            namespace: &namespace,
            options,
            store,
        };

        let mut ast = Ast::default();
        for generator in &self.features {
            run_generator(generator.as_ref(), &ctx, &mut ast).await?;
        }

        let side_channels = ast.side_channel_len();
        for generator in &self.workloads {
            run_generator(generator.as_ref(), &ctx, &mut ast).await?;
            if ast.side_channel_len() != side_channels {
                return Err(CompileError::LateSideChannel(generator.name().to_string()));
            }
        }

        let mut operations = ast.operations;
        for op in operations.iter_mut().filter(|op| op.kind.creates()) {
            stamp_ownership(op, &owner, &name);
        }

        debug_assert!(
            targets_are_unique(&operations),
            "generators produced two operations for the same target"
        );
        Ok(operations)
    }
}

async fn run_generator(
    generator: &dyn Generator,
    ctx: &CompilationContext<'_>,
    ast: &mut Ast,
) -> Result<(), CompileError> {
    debug!(generator = generator.name(), source = %ctx.name, "running generator");
    generator
        .generate(ctx, ast)
        .await
        .map_err(|e| CompileError::Generator {
            generator: generator.name().to_string(),
            source: e,
        })
}

fn stamp_ownership(op: &mut Operation, owner: &OwnerReference, app_name: &str) {
    let meta = &mut op.resource.metadata;

    let owners = meta.owner_references.get_or_insert_with(Vec::new);
    owners.retain(|o| o.uid != owner.uid);
    owners.push(owner.clone());

    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(APP_LABEL.to_string(), app_name.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
}

fn targets_are_unique(operations: &[Operation]) -> bool {
    let mut seen = std::collections::HashSet::new();
    operations.iter().all(|op| seen.insert(op.target()))
}
