//! Request and response bodies of the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{HistoryEntry, ReconcilePhase, TemplateRef};
use crate::template::{CacheStats, RenderedManifest};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue_depth: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    pub namespace: String,
    pub name: String,
    pub content_hash: String,
    pub resources: usize,
    /// Multi-document YAML as it would be applied or committed
    pub yaml: String,
}

impl ManifestResponse {
    pub fn new(namespace: String, name: String, manifest: &RenderedManifest, yaml: String) -> Self {
        Self {
            namespace,
            name,
            content_hash: manifest.content_hash.clone(),
            resources: manifest.resources.len(),
            yaml,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub items: Vec<HistoryEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct PhaseResponse {
    /// `None` until this process has reconciled the Module
    pub phase: Option<ReconcilePhase>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub queued: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub index: usize,
    pub template: TemplateRef,
    pub content_hash: String,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub invalidated: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
