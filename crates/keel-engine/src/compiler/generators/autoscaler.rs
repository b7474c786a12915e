use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use kube::api::ObjectMeta;

use super::{autoscaling_active, replicas};
use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError, Operation, OperationKind};

/// CPU-based HorizontalPodAutoscaler for applications
///
/// Emits a delete instead when autoscaling is disabled on the cluster or the
/// replica bounds leave nothing to scale, so a previously created autoscaler
/// stops fighting the Deployment's fixed replica count.
pub struct AutoscalerGenerator;

#[async_trait]
impl Generator for AutoscalerGenerator {
    fn name(&self) -> &str {
        "autoscaler"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        let Some(app) = ctx.application() else {
            return Ok(());
        };

        let metadata = ObjectMeta {
            name: Some(ctx.name.to_string()),
            namespace: Some(ctx.namespace.to_string()),
            labels: Some(ctx.labels()),
            ..Default::default()
        };

        if !autoscaling_active(ctx, app) {
            let hpa = HorizontalPodAutoscaler {
                metadata,
                ..Default::default()
            };
            ast.push(Operation::from_typed(OperationKind::DeleteIfExists, &hpa)?);
            return Ok(());
        }

        let bounds = replicas(app);
        let hpa = HorizontalPodAutoscaler {
            metadata,
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: ctx.name.to_string(),
                },
                min_replicas: Some(bounds.min.max(1)),
                max_replicas: bounds.max,
                metrics: Some(vec![MetricSpec {
                    type_: "Resource".to_string(),
                    resource: Some(ResourceMetricSource {
                        name: "cpu".to_string(),
                        target: MetricTarget {
                            type_: "Utilization".to_string(),
                            average_utilization: Some(bounds.cpu_threshold_percentage),
                            ..Default::default()
                        },
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        ast.push(Operation::from_typed(OperationKind::CreateOrUpdate, &hpa)?);
        Ok(())
    }
}
