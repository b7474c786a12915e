use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use super::port;
use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError, Operation, OperationKind};

/// ClusterIP Service exposing an application on port 80
pub struct ServiceGenerator;

#[async_trait]
impl Generator for ServiceGenerator {
    fn name(&self) -> &str {
        "service"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        let Some(app) = ctx.application() else {
            return Ok(());
        };

        let service = Service {
            metadata: ObjectMeta {
                name: Some(ctx.name.to_string()),
                namespace: Some(ctx.namespace.to_string()),
                labels: Some(ctx.labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(ctx.selector_labels()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(port(app))),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        ast.push(Operation::from_typed(OperationKind::CreateOrUpdate, &service)?);
        Ok(())
    }
}
