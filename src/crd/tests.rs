//! Unit tests for the Module, TemplateStore and TemplateAuthRule resources
//!
//! Covers spec validation, the wire format users write in manifests and the
//! generated CRD schemas.

#[cfg(test)]
mod module_spec_validation {
    use crate::crd::{GitOpsWriteDestination, ModuleSpec, ModuleTemplateRef, TemplateSourceType};
    use serde_json::json;

    /// Helper to create a minimal valid ModuleSpec pointing at a git template
    fn valid_spec() -> ModuleSpec {
        ModuleSpec {
            template: ModuleTemplateRef {
                repo: "https://github.com/acme/charts".to_string(),
                path: "web".to_string(),
                version: "v1.2.0".to_string(),
                source_type: TemplateSourceType::Git,
                store_ref: None,
            },
            values: json!({"replicas": 2}),
            target_namespace: None,
            git_ops_write: None,
        }
    }

    #[test]
    fn test_valid_spec_passes_validation() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_missing_repo_fails() {
        let mut spec = valid_spec();
        spec.template.repo = "  ".to_string();

        let err = spec.validate().unwrap_err();
        assert!(err.contains("spec.template.repo"));
    }

    #[test]
    fn test_store_ref_without_repo_passes() {
        let mut spec = valid_spec();
        spec.template = ModuleTemplateRef {
            store_ref: Some("web-store".to_string()),
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_git_ops_destination_requires_repo_and_branch() {
        let mut spec = valid_spec();
        spec.git_ops_write = Some(GitOpsWriteDestination {
            repo: String::new(),
            path: "clusters/prod".to_string(),
            branch: "main".to_string(),
        });
        assert!(spec.validate().unwrap_err().contains("gitOpsWrite.repo"));

        spec.git_ops_write = Some(GitOpsWriteDestination {
            repo: "https://github.com/acme/gitops".to_string(),
            path: "clusters/prod".to_string(),
            branch: String::new(),
        });
        assert!(spec.validate().unwrap_err().contains("gitOpsWrite.branch"));
    }

    #[test]
    fn test_empty_target_namespace_fails() {
        let mut spec = valid_spec();
        spec.target_namespace = Some(String::new());
        assert!(spec.validate().is_err());
    }
}

#[cfg(test)]
mod wire_format {
    use crate::crd::{
        GitOpsWriteDestination, Module, ModuleKey, ModuleSpec, ModuleTemplateRef, TemplateRef,
        TemplateSourceType,
    };
    use serde_json::json;

    #[test]
    fn test_module_deserializes_from_manifest() {
        let module: Module = serde_yaml::from_str(
            r#"
apiVersion: moduleops.io/v1alpha1
kind: Module
metadata:
  name: web
  namespace: apps
spec:
  template:
    repo: oci://registry.example.com/charts
    path: web
    version: 1.4.0
    sourceType: oci
  values:
    replicas: 3
    image:
      tag: "2.1"
  targetNamespace: team-a
  gitOpsWrite:
    repo: https://github.com/acme/gitops
    path: clusters/prod
"#,
        )
        .unwrap();

        assert_eq!(module.spec.template.source_type, TemplateSourceType::Oci);
        assert_eq!(module.spec.values["image"]["tag"], "2.1");
        assert_eq!(module.spec.target_namespace.as_deref(), Some("team-a"));
        let dest = module.spec.git_ops_write.as_ref().unwrap();
        assert_eq!(dest.branch, "main");
        assert_eq!(ModuleKey::from_module(&module), ModuleKey::new("apps", "web"));
    }

    #[test]
    fn test_values_default_to_null() {
        let spec: ModuleSpec = serde_json::from_value(json!({
            "template": {"repo": "https://github.com/acme/charts"}
        }))
        .unwrap();
        assert!(spec.values.is_null());
        assert_eq!(spec.template.source_type, TemplateSourceType::Git);
    }

    #[test]
    fn test_template_ref_conversions() {
        let reference = TemplateRef::new(
            TemplateSourceType::HelmRepo,
            "https://charts.example.com",
            "nginx",
            "15.0.0",
        );
        let module_ref = ModuleTemplateRef::from(&reference);
        assert_eq!(module_ref.repo, "https://charts.example.com");
        assert_eq!(module_ref.store_ref, None);
        assert_eq!(module_ref.to_template_ref(), reference);
    }

    #[test]
    fn test_template_ref_display() {
        let reference = TemplateRef::new(
            TemplateSourceType::Git,
            "https://github.com/acme/charts/",
            "/web/",
            "",
        );
        assert_eq!(reference.to_string(), "git:https://github.com/acme/charts/web@latest");

        let reference = TemplateRef::new(TemplateSourceType::Oci, "oci://r.example.com/web", "", "1.0.0");
        assert_eq!(reference.to_string(), "oci:oci://r.example.com/web@1.0.0");
    }

    #[test]
    fn test_git_ops_file_path() {
        let dest = |path: &str| GitOpsWriteDestination {
            repo: "https://github.com/acme/gitops".to_string(),
            path: path.to_string(),
            branch: "main".to_string(),
        };
        assert_eq!(dest("clusters/prod/").file_path("web"), "clusters/prod/web.yaml");
        assert_eq!(dest("apps/web.yml").file_path("web"), "apps/web.yml");
        assert_eq!(dest("").file_path("web"), "web.yaml");
    }
}

#[cfg(test)]
mod crd_generation {
    use crate::crd::{Module, TemplateAuthRule, TemplateStore};
    use kube::CustomResourceExt;

    #[test]
    fn test_module_crd() {
        let crd = Module::crd();
        assert_eq!(crd.spec.group, "moduleops.io");
        assert_eq!(crd.spec.names.kind, "Module");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());

        // values must keep arbitrary user keys
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields: true"));
    }

    #[test]
    fn test_store_and_auth_rule_crds() {
        assert_eq!(TemplateStore::crd().spec.names.kind, "TemplateStore");
        assert_eq!(TemplateAuthRule::crd().spec.names.kind, "TemplateAuthRule");
        assert_eq!(TemplateStore::crd().spec.names.short_names, Some(vec!["ts".to_string()]));
    }
}
