//! Finalizer handling for Module cleanup
//!
//! The finalizer keeps a deleted Module around until the reconciler has
//! removed every resource it applied for it. GitOps Modules only drop the
//! finalizer; their cleanup happens in the repository.

use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::crd::Module;
use crate::error::Result;

pub const MODULE_FINALIZER: &str = "moduleops.io/finalizer";

pub async fn add_finalizer(client: &Client, module: &Module) -> Result<()> {
    let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Module> = Api::namespaced(client.clone(), &namespace);

    let mut finalizers: Vec<String> = module.finalizers().to_vec();
    if finalizers.iter().any(|f| f == MODULE_FINALIZER) {
        return Ok(());
    }
    finalizers.push(MODULE_FINALIZER.to_string());

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &module.name_any(),
        &PatchParams::apply("moduleops"),
        &Patch::Merge(&patch),
    )
    .await?;
    info!("Added finalizer to Module: {}", module.name_any());
    Ok(())
}

/// Called once cleanup is complete; Kubernetes then finishes the deletion
pub async fn remove_finalizer(client: &Client, module: &Module) -> Result<()> {
    let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Module> = Api::namespaced(client.clone(), &namespace);

    let finalizers: Vec<String> = module
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != MODULE_FINALIZER)
        .cloned()
        .collect();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(
        &module.name_any(),
        &PatchParams::apply("moduleops"),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Removed finalizer from Module: {}", module.name_any());
    Ok(())
}

pub fn is_being_deleted(module: &Module) -> bool {
    module.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(module: &Module) -> bool {
    module.finalizers().iter().any(|f| f == MODULE_FINALIZER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ModuleSpec, ModuleTemplateRef};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn module() -> Module {
        Module::new(
            "web",
            ModuleSpec {
                template: ModuleTemplateRef {
                    repo: "https://github.com/x/charts".into(),
                    ..Default::default()
                },
                values: serde_json::Value::Null,
                target_namespace: None,
                git_ops_write: None,
            },
        )
    }

    #[test]
    fn test_finalizer_name() {
        assert_eq!(MODULE_FINALIZER, "moduleops.io/finalizer");
    }

    #[test]
    fn test_has_finalizer() {
        let mut m = module();
        assert!(!has_finalizer(&m));
        m.metadata.finalizers = Some(vec![MODULE_FINALIZER.to_string()]);
        assert!(has_finalizer(&m));
    }

    #[test]
    fn test_is_being_deleted() {
        let mut m = module();
        assert!(!is_being_deleted(&m));
        m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_being_deleted(&m));
    }
}
