//! Platform environment variables injected into every workload

use async_trait::async_trait;
use k8s_openapi::api::core::v1::EnvVar;

use crate::compiler::{Ast, CompilationContext, Generator, GeneratorError};

/// Adds `KEEL_*` env vars describing where the workload runs
pub struct ProjectEnvGenerator;

fn var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl Generator for ProjectEnvGenerator {
    fn name(&self) -> &str {
        "project-env"
    }

    async fn generate(
        &self,
        ctx: &CompilationContext<'_>,
        ast: &mut Ast,
    ) -> Result<(), GeneratorError> {
        ast.env.push(var("KEEL_APP_NAME", ctx.name));
        ast.env.push(var("KEEL_NAMESPACE", ctx.namespace));
        ast.env.push(var("KEEL_CLUSTER_NAME", &ctx.options.cluster_name));
        if let Some(project_id) = &ctx.options.project_id {
            ast.env.push(var("KEEL_PROJECT_ID", project_id));
        }
        Ok(())
    }
}
