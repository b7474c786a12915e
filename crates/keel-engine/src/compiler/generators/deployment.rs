use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::discovery::ApiResource;

use super::{autoscaling_active, pod_spec, port, replicas};
use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError, Operation, OperationKind};

/// The application's Deployment
///
/// While an autoscaler is active the live replica count is kept, otherwise
/// every rollout would reset what the autoscaler decided.
pub struct DeploymentGenerator;

impl DeploymentGenerator {
    async fn replica_count(
        ctx: &CompilationContext<'_>,
        min: i32,
        autoscaled: bool,
    ) -> Result<i32, GeneratorError> {
        if !autoscaled {
            return Ok(min);
        }
        let live = ctx
            .store
            .get(
                &ApiResource::erase::<Deployment>(&()),
                Some(ctx.namespace),
                ctx.name,
            )
            .await?;
        let current = live
            .as_ref()
            .and_then(|d| d.data.pointer("/spec/replicas"))
            .and_then(|r| r.as_i64())
            .and_then(|r| i32::try_from(r).ok());
        Ok(current.unwrap_or(min).max(min))
    }
}

#[async_trait]
impl Generator for DeploymentGenerator {
    fn name(&self) -> &str {
        "deployment"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        let Some(app) = ctx.application() else {
            return Ok(());
        };

        let replicas =
            Self::replica_count(ctx, replicas(app).min, autoscaling_active(ctx, app)).await?;

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(ctx.name.to_string()),
                namespace: Some(ctx.namespace.to_string()),
                labels: Some(ctx.labels()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(ctx.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(ctx.labels()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec(ctx, ast, Some(port(app)), "Always")),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        ast.push(Operation::from_typed(OperationKind::CreateOrUpdate, &deployment)?);
        Ok(())
    }
}
