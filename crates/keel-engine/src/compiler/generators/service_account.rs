use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::ObjectMeta;

use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError, Operation, OperationKind};

/// One ServiceAccount per workload, named after it
///
/// Created once and left alone afterwards so tokens and pull secrets added by
/// other controllers survive.
pub struct ServiceAccountGenerator;

#[async_trait]
impl Generator for ServiceAccountGenerator {
    fn name(&self) -> &str {
        "service-account"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(ctx.name.to_string()),
                namespace: Some(ctx.namespace.to_string()),
                labels: Some(ctx.labels()),
                ..Default::default()
            },
            automount_service_account_token: Some(false),
            ..Default::default()
        };
        ast.push(Operation::from_typed(OperationKind::CreateIfNotExists, &sa)?);
        Ok(())
    }
}
