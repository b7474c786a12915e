use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::ObjectMeta;

use super::pod_spec;
use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError, Operation, OperationKind};

/// The batch/v1 Job for a KeelJob
///
/// A Job's pod template is immutable, so each rollout deletes and recreates it.
pub struct JobGenerator;

#[async_trait]
impl Generator for JobGenerator {
    fn name(&self) -> &str {
        "job"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        let Some(keel_job) = ctx.job() else {
            return Ok(());
        };

        let job = Job {
            metadata: ObjectMeta {
                name: Some(ctx.name.to_string()),
                namespace: Some(ctx.namespace.to_string()),
                labels: Some(ctx.labels()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: keel_job.spec.backoff_limit,
                active_deadline_seconds: keel_job.spec.active_deadline_seconds,
                ttl_seconds_after_finished: keel_job.spec.ttl_seconds_after_finished,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(ctx.labels()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec(ctx, ast, None, "Never")),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        ast.push(Operation::from_typed(OperationKind::CreateOrRecreate, &job)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::generators::test_support::run;
    use crate::normalize::normalize;
    use crate::options::Options;
    use crate::testing::{sample_app, sample_job, MemoryStore};

    #[tokio::test]
    async fn job_carries_normalized_limits() {
        let store = MemoryStore::new();
        let source = normalize(&sample_job("migrate", "team-a", "repo/migrate:v1")).unwrap();
        let mut ast = Ast::default();

        run(&JobGenerator, &source, &Options::new("dev"), &store, &mut ast).await;

        let op = &ast.operations[0];
        assert_eq!(op.kind, OperationKind::CreateOrRecreate);
        let spec = &op.resource.data["spec"];
        assert_eq!(spec["backoffLimit"], 6);
        assert_eq!(spec["ttlSecondsAfterFinished"], 86_400);
        assert_eq!(spec["template"]["spec"]["restartPolicy"], "Never");
        assert!(spec["template"]["spec"]["containers"][0].get("ports").is_none());
    }

    #[tokio::test]
    async fn applications_get_no_job() {
        let store = MemoryStore::new();
        let source = sample_app("app-a", "team-a", "repo/app:v1");
        let mut ast = Ast::default();

        run(&JobGenerator, &source, &Options::new("dev"), &store, &mut ast).await;

        assert!(ast.operations.is_empty());
    }
}
