//! The pluggable generator seam
//!
//! Core generators live in [`super::generators`]. Feature generators (network
//! policy, mesh routing, managed databases, sidecars) implement the same trait
//! and are added with [`super::ResourceCompiler::with_generator`]; they run
//! after the core feature generators and before the workload is built, so
//! containers and env they add land in the pod.

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_common::crd::{KeelApplication, KeelJob, Source};
use keel_common::{APP_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use thiserror::Error;

use super::Ast;
use crate::options::Options;
use crate::store::{StoreError, StoreReader};

/// Failure inside a single generator
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// A read-only store query failed
    #[error("lookup failed: {0}")]
    Lookup(#[from] StoreError),
    /// The desired object could not be built
    #[error("{0}")]
    Build(String),
}

impl From<keel_common::Error> for GeneratorError {
    fn from(err: keel_common::Error) -> Self {
        Self::Build(err.to_string())
    }
}

/// Immutable context available to all generators of one compile
pub struct CompilationContext<'a> {
    /// The normalized Source
    pub source: &'a Source,
    /// Source name
    pub name: &'a str,
    /// Source namespace
    pub namespace: &'a str,
    /// Options resolved for this rollout
    pub options: &'a Options,
    /// Read-only view of the cluster
    pub store: StoreReader<'a>,
}

impl CompilationContext<'_> {
    /// Labels every generated object and pod carries
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (APP_LABEL.to_string(), self.name.to_string()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    /// Labels used as the pod selector
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL.to_string(), self.name.to_string())])
    }

    /// The Source as an application, if it is one
    pub fn application(&self) -> Option<&KeelApplication> {
        match self.source {
            Source::Application(app) => Some(app),
            Source::Job(_) => None,
        }
    }

    /// The Source as a job, if it is one
    pub fn job(&self) -> Option<&KeelJob> {
        match self.source {
            Source::Job(job) => Some(job),
            Source::Application(_) => None,
        }
    }
}

/// A pluggable step of the compilation pipeline.
///
/// Generators run in registration order and may read anything earlier
/// generators appended to the [`Ast`].
///
/// # Example
///
/// ```ignore
/// struct PodDisruptionBudgetGenerator;
///
/// #[async_trait]
/// impl Generator for PodDisruptionBudgetGenerator {
///     fn name(&self) -> &str { "pod-disruption-budget" }
///
///     async fn generate(
///         &self,
///         ctx: &CompilationContext<'_>,
///         ast: &mut Ast,
///     ) -> Result<(), GeneratorError> {
///         let Some(_) = ctx.application() else { return Ok(()) };
///         ast.push(Operation::from_typed(OperationKind::CreateOrUpdate, &build_pdb(ctx))?);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable name (used in error messages and logging)
    fn name(&self) -> &str;

    /// Append operations and side-channel fragments to `ast`.
    ///
    /// Return an error to abort compilation with an attribution to this generator.
    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError>;
}
