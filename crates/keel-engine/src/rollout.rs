//! The result of one successful compilation, ready to execute

use keel_common::crd::{Source, SourceKey};

use crate::audit::ImageRef;
use crate::compiler::Operation;
use crate::error::ExecuteError;
use crate::options::Options;

/// Everything needed to apply and then monitor one version of a Source
#[derive(Clone, Debug)]
pub struct Rollout {
    /// Identity of the Source
    pub key: SourceKey,
    /// Normalized Source
    pub source: Source,
    /// Options resolved for this rollout
    pub options: Options,
    /// Operations in execution order
    pub operations: Vec<Operation>,
    /// Correlation id
    pub correlation_id: String,
    /// Spec hash
    pub hash: String,
    /// Parsed main container image
    pub image: ImageRef,
}

impl Rollout {
    /// Assemble a rollout; fails permanently when the image cannot be parsed
    pub fn new(
        key: SourceKey,
        source: Source,
        options: Options,
        operations: Vec<Operation>,
        correlation_id: String,
        hash: String,
    ) -> Result<Self, ExecuteError> {
        let image = ImageRef::parse(&source.container().image)?;
        Ok(Self {
            key,
            source,
            options,
            operations,
            correlation_id,
            hash,
            image,
        })
    }
}
