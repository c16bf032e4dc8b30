//! TemplateStore and TemplateAuthRule Custom Resource Definitions

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{GitOpsWriteDestination, SecretKeyRef, TemplateRef, TemplateSourceType};

/// Annotation carrying the icon shown for a TemplateStore entry
pub const ICON_URL_ANNOTATION: &str = "moduleops.io/icon-url";

/// A named, reusable template reference
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "moduleops.io",
    version = "v1alpha1",
    kind = "TemplateStore",
    namespaced,
    shortname = "ts",
    printcolumn = r#"{"name":"Repo","type":"string","jsonPath":".spec.repo"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStoreSpec {
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source_type: TemplateSourceType,

    /// Modules using this store always write back to this destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_git_ops_write: Option<GitOpsWriteDestination>,
}

impl TemplateStoreSpec {
    pub fn template_ref(&self) -> TemplateRef {
        TemplateRef::new(
            self.source_type,
            self.repo.clone(),
            self.path.clone(),
            self.version.clone(),
        )
    }
}

/// Maps a repository URL prefix to credentials stored in a Secret
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "moduleops.io",
    version = "v1alpha1",
    kind = "TemplateAuthRule",
    namespaced,
    printcolumn = r#"{"name":"Repo","type":"string","jsonPath":".spec.repo"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateAuthRuleSpec {
    /// Repository URL prefix the rule applies to
    pub repo: String,
    pub username: SecretKeyRef,
    pub password: SecretKeyRef,
}
