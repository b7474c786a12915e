//! CRD installation
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the schema in the cluster always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use keel_common::crd::{KeelApplication, KeelJob};
use keel_common::CONTROLLER_NAME;

/// CRD definition with name and resource
pub struct CrdDef {
    /// `<plural>.<group>`
    pub name: &'static str,
    /// The definition
    pub crd: CustomResourceDefinition,
}

/// Every CRD the operator serves
pub fn keel_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "keelapplications.keel.dev",
            crd: KeelApplication::crd(),
        },
        CrdDef {
            name: "keeljobs.keel.dev",
            crd: KeelJob::crd(),
        },
    ]
}

/// All CRDs as one multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let mut out = String::new();
    for def in keel_crds() {
        let doc = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}

/// Install or update the CRDs using server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    for def in keel_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }
    tracing::info!("CRDs installed/updated");
    Ok(())
}
