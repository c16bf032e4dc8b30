//! Shared types for Module and TemplateStore specifications
//!
//! # Type Hierarchy
//!
//! - [`TemplateSourceType`] - Where a template is fetched from (git, Helm repository, OCI registry)
//! - [`TemplateRef`] - Immutable identity of a versioned template
//! - [`GitOpsWriteDestination`] - Repository location a rendered manifest is committed to
//! - [`HistoryEntry`] - Snapshot of a successful reconciliation
//! - [`Condition`] - Status condition following Kubernetes API conventions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supported template sources
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum TemplateSourceType {
    /// Git repository; `version` is a branch, tag or commit
    #[default]
    Git,
    /// Helm chart repository serving an `index.yaml`
    HelmRepo,
    /// OCI registry holding Helm chart artifacts
    Oci,
}

impl std::fmt::Display for TemplateSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateSourceType::Git => write!(f, "git"),
            TemplateSourceType::HelmRepo => write!(f, "helmRepo"),
            TemplateSourceType::Oci => write!(f, "oci"),
        }
    }
}

/// Identity of a versioned template
///
/// Used as the key for the template cache and for fetching; two different
/// versions of the same repository/path are different templates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    /// Repository URL (`https://...`, `oci://...`)
    #[serde(rename = "repo")]
    pub source_url: String,
    /// Path inside the repository, or the chart name for Helm/OCI sources
    #[serde(default)]
    pub path: String,
    /// Branch/tag/commit for git, chart version for Helm/OCI. Empty means latest.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source_type: TemplateSourceType,
}

impl TemplateRef {
    pub fn new(
        source_type: TemplateSourceType,
        source_url: impl Into<String>,
        path: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            path: path.into(),
            version: version.into(),
            source_type,
        }
    }
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = if self.version.is_empty() {
            "latest"
        } else {
            &self.version
        };
        if self.path.is_empty() {
            write!(f, "{}:{}@{}", self.source_type, self.source_url, version)
        } else {
            write!(
                f,
                "{}:{}/{}@{}",
                self.source_type,
                self.source_url.trim_end_matches('/'),
                self.path.trim_matches('/'),
                version
            )
        }
    }
}

/// Repository location a rendered manifest is committed to instead of being applied
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsWriteDestination {
    pub repo: String,
    /// File path, or a directory in which `<module>.yaml` is written
    pub path: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GitOpsWriteDestination {
    /// File the manifest of `module_name` is written to
    pub fn file_path(&self, module_name: &str) -> String {
        let path = self.path.trim_matches('/');
        if path.ends_with(".yaml") || path.ends_with(".yml") {
            path.to_string()
        } else if path.is_empty() {
            format!("{module_name}.yaml")
        } else {
            format!("{path}/{module_name}.yaml")
        }
    }
}

/// Reference to a key within a Secret
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Snapshot of a successful reconciliation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Multi-document YAML of the rendered manifest
    pub manifest: String,
    /// Values the manifest was rendered with
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub values: serde_json::Value,
    pub template: TemplateRef,
    pub content_hash: String,
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// `Applied` or `Committed`
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Reconciliation phase of a Module
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ReconcilePhase {
    #[default]
    Pending,
    Resolving,
    Rendering,
    Diffing,
    Applying,
    Succeeded,
    Failed,
}

impl std::fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconcilePhase::Pending => "Pending",
            ReconcilePhase::Resolving => "Resolving",
            ReconcilePhase::Rendering => "Rendering",
            ReconcilePhase::Diffing => "Diffing",
            ReconcilePhase::Applying => "Applying",
            ReconcilePhase::Succeeded => "Succeeded",
            ReconcilePhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Status condition following Kubernetes API conventions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
