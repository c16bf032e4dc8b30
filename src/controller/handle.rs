//! Operations exposed to the REST API and other in-process callers

use std::sync::Arc;

use tracing::info;

use super::queue::WorkQueue;
use super::reconciler::Reconciler;
use crate::crd::{HistoryEntry, ModuleKey, ModuleTemplateRef, ReconcilePhase, TemplateRef};
use crate::error::{Error, Result};
use crate::template::{CacheStats, RenderedManifest};

#[derive(Clone)]
pub struct ControllerHandle {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
}

impl ControllerHandle {
    pub fn new(reconciler: Arc<Reconciler>, queue: Arc<WorkQueue>) -> Self {
        Self { reconciler, queue }
    }

    /// Queue an attempt now, including for Modules that failed terminally
    pub fn trigger_reconcile(&self, key: &ModuleKey) {
        info!("Reconcile of {} triggered", key);
        self.reconciler.force(key);
        self.queue.add(key.clone());
    }

    /// Last successfully rendered manifest, without re-rendering
    ///
    /// Falls back to the newest history snapshot in the Module's status when
    /// this process has not reconciled the Module yet.
    pub async fn rendered_manifest(&self, key: &ModuleKey) -> Result<Option<RenderedManifest>> {
        if let Some(manifest) = self.reconciler.rendered_manifest(key) {
            return Ok(Some(manifest.as_ref().clone()));
        }
        let history = self.history(key).await?;
        match history.last() {
            Some(entry) => Ok(Some(self.reconciler.renderer().parse_manifest(&entry.manifest)?)),
            None => Ok(None),
        }
    }

    /// Reconciliation history, oldest first
    pub async fn history(&self, key: &ModuleKey) -> Result<Vec<HistoryEntry>> {
        if let Some(history) = self.reconciler.history(key) {
            return Ok(history);
        }
        let module = self
            .reconciler
            .store()
            .get_module(key)
            .await?
            .ok_or_else(|| Error::ValidationError(format!("Module {key} not found")))?;
        Ok(module.status.map(|s| s.history).unwrap_or_default())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.reconciler.templates().cache_stats()
    }

    /// Drop a cached template so the next resolve refetches it
    pub fn invalidate_template(&self, reference: &TemplateRef) -> bool {
        self.reconciler.templates().invalidate(reference)
    }

    pub fn module_phase(&self, key: &ModuleKey) -> Option<ReconcilePhase> {
        self.reconciler.phase(key)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Point the Module back at the template and values of history entry
    /// `index` (oldest first) and reconcile it
    pub async fn rollback(&self, key: &ModuleKey, index: usize) -> Result<HistoryEntry> {
        let history = self.history(key).await?;
        let entry = history.get(index).cloned().ok_or_else(|| {
            Error::ValidationError(format!(
                "Module {key} has {} history entries, no entry {index}",
                history.len()
            ))
        })?;
        let template = ModuleTemplateRef::from(&entry.template);
        self.reconciler
            .store()
            .patch_spec(key, &template, &entry.values)
            .await?;
        info!("Rolled {} back to history entry {} ({})", key, index, entry.template);
        self.trigger_reconcile(key);
        Ok(entry)
    }
}
