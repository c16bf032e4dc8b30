//! Module Custom Resource Definition
//!
//! A Module is user-declared desired state: a template reference, the values
//! to render it with, and where the result goes (a target namespace, or a
//! GitOps repository when write-back is configured).

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, GitOpsWriteDestination, HistoryEntry, ReconcilePhase, TemplateRef,
    TemplateSourceType,
};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "moduleops.io",
    version = "v1alpha1",
    kind = "Module",
    namespaced,
    status = "ModuleStatus",
    shortname = "mod",
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.template.repo"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.template.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub template: ModuleTemplateRef,

    #[serde(default)]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub values: serde_json::Value,

    /// Namespace rendered resources are placed in. Defaults to the Module's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Commit the rendered manifest here instead of applying it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_write: Option<GitOpsWriteDestination>,
}

/// Template reference as written on a Module
///
/// Either points at a template directly or names a TemplateStore whose
/// reference (and enforced GitOps destination) is used instead.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTemplateRef {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source_type: TemplateSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_ref: Option<String>,
}

impl ModuleTemplateRef {
    pub fn to_template_ref(&self) -> TemplateRef {
        TemplateRef::new(
            self.source_type,
            self.repo.clone(),
            self.path.clone(),
            self.version.clone(),
        )
    }
}

impl From<&TemplateRef> for ModuleTemplateRef {
    fn from(r: &TemplateRef) -> Self {
        Self {
            repo: r.source_url.clone(),
            path: r.path.clone(),
            version: r.version.clone(),
            source_type: r.source_type,
            store_ref: None,
        }
    }
}

impl ModuleSpec {
    /// Validate the parts of the spec that do not depend on the template
    pub fn validate(&self) -> Result<(), String> {
        if self.template.store_ref.is_none() && self.template.repo.trim().is_empty() {
            return Err("spec.template.repo is required unless spec.template.storeRef is set".into());
        }
        if let Some(dest) = &self.git_ops_write {
            if dest.repo.trim().is_empty() {
                return Err("spec.gitOpsWrite.repo must not be empty".into());
            }
            if dest.branch.trim().is_empty() {
                return Err("spec.gitOpsWrite.branch must not be empty".into());
            }
        }
        if let Some(ns) = &self.target_namespace {
            if ns.trim().is_empty() {
                return Err("spec.targetNamespace must not be empty when set".into());
            }
        }
        Ok(())
    }
}

/// Status subresource for Module
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default)]
    pub phase: ReconcilePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Machine-readable reason of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Whether the last failure is retried automatically
    #[serde(default)]
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,

    /// Revision the template version resolved to at the last success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<String>,

    #[serde(default)]
    pub failure_count: u32,

    /// Successful reconciliations, oldest first
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Identity of a Module within the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    pub namespace: String,
    pub name: String,
}

impl ModuleKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_module(module: &Module) -> Self {
        Self::new(
            module.namespace().unwrap_or_else(|| "default".to_string()),
            module.name_any(),
        )
    }
}

impl std::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
