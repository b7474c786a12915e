//! Secrets exposed to the main container through envFrom

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvFromSource, Secret, SecretEnvSource};
use keel_common::REFERENCED_BY_ANNOTATION_PREFIX;
use kube::api::ObjectMeta;

use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError, Operation, OperationKind};

/// Adds an envFrom entry per referenced Secret and back-annotates the Secret
///
/// The Secret itself is never created or owned; the annotation is skipped
/// when it does not exist yet.
pub struct SecretRefsGenerator;

#[async_trait]
impl Generator for SecretRefsGenerator {
    fn name(&self) -> &str {
        "secret-refs"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        for secret_name in &ctx.source.container().env_from_secrets {
            ast.env_from.push(EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: secret_name.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            });

            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.clone()),
                    namespace: Some(ctx.namespace.to_string()),
                    annotations: Some(BTreeMap::from([(
                        format!("{}{}", REFERENCED_BY_ANNOTATION_PREFIX, ctx.name),
                        ctx.source.kind().as_str().to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            };
            ast.push(Operation::from_typed(OperationKind::AnnotateIfExists, &secret)?);
        }
        Ok(())
    }
}
