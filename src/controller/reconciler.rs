//! Per-Module reconciliation
//!
//! One call to [`Reconciler::reconcile`] runs a single attempt for a Module:
//! resolve credentials and the template, render, then either commit the
//! manifest to the GitOps destination or diff it against the cluster and
//! apply. The reconciler is the only place where errors are classified as
//! retryable or terminal and written to the Module's status.
//!
//! A failed attempt never touches the last-known-good manifest or the
//! history; both only move forward on success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::apply::{self, PlanSummary};
use super::cluster::{ClusterClient, LiveObject};
use super::conditions;
use super::finalizers::{has_finalizer, is_being_deleted};
use super::runtime::calculate_backoff;
use super::store::{ModuleStore, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::auth::CredentialsResolver;
use crate::crd::{
    GitOpsWriteDestination, HistoryEntry, Module, ModuleKey, ReconcilePhase, TemplateRef,
};
use crate::error::{Error, Result};
use crate::gitops::{CommitContext, CommitRef, GitWriteClient};
use crate::template::{RenderTarget, RenderedManifest, Renderer, Template, TemplateRepository, ValueNode};

pub const OUTCOME_APPLIED: &str = "Applied";
pub const OUTCOME_COMMITTED: &str = "Committed";

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// History entries kept per Module
    pub history_limit: usize,
    /// Namespace forced onto every rendered namespaced resource
    pub target_namespace_override: Option<String>,
    pub attempt_timeout: Duration,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            target_namespace_override: None,
            attempt_timeout: Duration::from_secs(120),
            backoff_base_secs: 15,
            backoff_max_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Succeeded,
    /// Retryable failure; requeue after the delay
    Retry(Duration),
    /// Not retried until the spec changes or a reconcile is triggered
    Terminal,
    /// The Module is gone and its bookkeeping has been dropped
    Deleted,
}

#[derive(Default)]
struct ModuleRecord {
    phase: ReconcilePhase,
    last_good: Option<Arc<RenderedManifest>>,
    history: VecDeque<HistoryEntry>,
    failures: u32,
    /// Generation that failed terminally; skipped until it changes
    terminal_generation: Option<i64>,
    forced: bool,
    seeded: bool,
}

/// Everything a successful attempt produced
struct Attempt {
    reference: TemplateRef,
    template: Arc<Template>,
    manifest: Arc<RenderedManifest>,
    commit: Option<CommitRef>,
    summary: Option<PlanSummary>,
}

pub struct Reconciler {
    store: Arc<dyn ModuleStore>,
    cluster: Arc<dyn ClusterClient>,
    credentials: CredentialsResolver,
    templates: Arc<TemplateRepository>,
    renderer: Renderer,
    git: Arc<GitWriteClient>,
    config: ReconcilerConfig,
    records: Mutex<HashMap<ModuleKey, ModuleRecord>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ModuleStore>,
        cluster: Arc<dyn ClusterClient>,
        credentials: CredentialsResolver,
        templates: Arc<TemplateRepository>,
        git: Arc<GitWriteClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            cluster,
            credentials,
            templates,
            renderer: Renderer::default(),
            git,
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn templates(&self) -> &Arc<TemplateRepository> {
        &self.templates
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn store(&self) -> &Arc<dyn ModuleStore> {
        &self.store
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ModuleKey, ModuleRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Most recent successfully rendered manifest held in memory
    pub fn rendered_manifest(&self, key: &ModuleKey) -> Option<Arc<RenderedManifest>> {
        self.records().get(key).and_then(|r| r.last_good.clone())
    }

    /// History held in memory, oldest first; `None` if the Module is unknown
    pub fn history(&self, key: &ModuleKey) -> Option<Vec<HistoryEntry>> {
        self.records()
            .get(key)
            .filter(|r| r.seeded)
            .map(|r| r.history.iter().cloned().collect())
    }

    pub fn phase(&self, key: &ModuleKey) -> Option<ReconcilePhase> {
        self.records().get(key).map(|r| r.phase)
    }

    /// Let the next attempt run even if the current generation failed terminally
    pub fn force(&self, key: &ModuleKey) {
        self.records().entry(key.clone()).or_default().forced = true;
    }

    fn set_phase(&self, key: &ModuleKey, phase: ReconcilePhase) {
        debug!("{} -> {}", key, phase);
        self.records().entry(key.clone()).or_default().phase = phase;
    }

    fn forget(&self, key: &ModuleKey) {
        if self.records().remove(key).is_some() {
            debug!("Dropped bookkeeping for {}", key);
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        calculate_backoff(
            failures.saturating_sub(1),
            Some(self.config.backoff_base_secs),
            Some(self.config.backoff_max_secs),
        )
    }

    fn bump_failures(&self, key: &ModuleKey) -> u32 {
        let mut records = self.records();
        let record = records.entry(key.clone()).or_default();
        record.failures += 1;
        record.failures
    }

    #[instrument(skip(self), fields(module = %key))]
    pub async fn reconcile(&self, key: &ModuleKey) -> ReconcileOutcome {
        let module = match self.store.get_module(key).await {
            Ok(Some(module)) => module,
            Ok(None) => {
                self.forget(key);
                return ReconcileOutcome::Deleted;
            }
            Err(e) => {
                warn!("Failed to read Module {}: {}", key, e);
                return ReconcileOutcome::Retry(self.backoff(self.bump_failures(key)));
            }
        };

        if is_being_deleted(&module) {
            return self.finalize(key, &module).await;
        }

        if self.skip_terminal(key, &module) {
            debug!("Generation {:?} failed terminally, waiting for a spec change", module.metadata.generation);
            return ReconcileOutcome::Terminal;
        }

        if !has_finalizer(&module) {
            if let Err(e) = self.store.add_finalizer(&module).await {
                warn!("Failed to add finalizer to {}: {}", key, e);
                return ReconcileOutcome::Retry(self.backoff(self.bump_failures(key)));
            }
        }
        self.seed(key, &module);
        self.set_phase(key, ReconcilePhase::Pending);

        let result = match tokio::time::timeout(self.config.attempt_timeout, self.attempt(key, &module)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.attempt_timeout)),
        };
        match result {
            Ok(attempt) => self.record_success(key, &module, attempt).await,
            Err(e) => self.record_failure(key, &module, e).await,
        }
    }

    fn skip_terminal(&self, key: &ModuleKey, module: &Module) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(key) else {
            return false;
        };
        if std::mem::take(&mut record.forced) {
            record.terminal_generation = None;
            return false;
        }
        record.terminal_generation.is_some() && record.terminal_generation == module.metadata.generation
    }

    /// Load history and the last-known-good manifest from status after a restart
    fn seed(&self, key: &ModuleKey, module: &Module) {
        let mut records = self.records();
        let record = records.entry(key.clone()).or_default();
        if record.seeded {
            return;
        }
        record.seeded = true;
        let Some(status) = &module.status else {
            return;
        };
        record.history = status.history.iter().cloned().collect();
        record.failures = status.failure_count;
        if let Some(last) = status.history.last() {
            match self.renderer.parse_manifest(&last.manifest) {
                Ok(manifest) => record.last_good = Some(Arc::new(manifest)),
                Err(e) => warn!("Ignoring unreadable history snapshot of {}: {}", key, e),
            }
        }
    }

    async fn attempt(&self, key: &ModuleKey, module: &Module) -> Result<Attempt> {
        module.spec.validate().map_err(Error::ValidationError)?;

        self.set_phase(key, ReconcilePhase::Resolving);
        let (reference, destination) = self.resolve_reference(module).await?;
        let credentials = self.credentials.resolve(&reference).await?;
        let template = self.templates.resolve(&reference, &credentials).await?;

        self.set_phase(key, ReconcilePhase::Rendering);
        let target = RenderTarget {
            module_name: key.name.clone(),
            namespace: self.target_namespace(module, key),
        };
        let values = ValueNode::from(&module.spec.values);
        let manifest = Arc::new(self.renderer.render(&template, &values, &target)?);

        let mut attempt = Attempt {
            reference,
            template,
            manifest,
            commit: None,
            summary: None,
        };
        match destination {
            Some(dest) => {
                self.set_phase(key, ReconcilePhase::Applying);
                attempt.commit = Some(self.write_back(key, &dest, &attempt).await?);
            }
            None => {
                self.set_phase(key, ReconcilePhase::Diffing);
                attempt.manifest = self.scope_unknown_kinds(&attempt.manifest).await?;
                let previous = self.rendered_manifest(key);
                let live = self.live_state(key, &attempt.manifest, previous.as_deref()).await?;
                let plan = apply::plan(&attempt.manifest, &live, key, self.renderer.kinds())?;
                debug!("Plan for {}: {}", key, plan.summary());

                self.set_phase(key, ReconcilePhase::Applying);
                attempt.summary = Some(apply::execute(self.cluster.as_ref(), &plan, key).await?);
            }
        }
        Ok(attempt)
    }

    /// TemplateRef and GitOps destination, following `storeRef` when set.
    /// A store's enforced destination wins over the Module's own.
    async fn resolve_reference(&self, module: &Module) -> Result<(TemplateRef, Option<GitOpsWriteDestination>)> {
        let Some(store_name) = &module.spec.template.store_ref else {
            return Ok((module.spec.template.to_template_ref(), module.spec.git_ops_write.clone()));
        };
        let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
        let store = self
            .store
            .get_template_store(&namespace, store_name)
            .await?
            .ok_or_else(|| Error::ValidationError(format!("TemplateStore {namespace}/{store_name} not found")))?;
        let destination = store
            .enforce_git_ops_write
            .clone()
            .or_else(|| module.spec.git_ops_write.clone());
        Ok((store.template_ref(), destination))
    }

    fn target_namespace(&self, module: &Module, key: &ModuleKey) -> String {
        self.config
            .target_namespace_override
            .clone()
            .or_else(|| module.spec.target_namespace.clone())
            .unwrap_or_else(|| key.namespace.clone())
    }

    async fn write_back(&self, key: &ModuleKey, dest: &GitOpsWriteDestination, attempt: &Attempt) -> Result<CommitRef> {
        let credentials = self.credentials.resolve_repo(&dest.repo).await?;
        let template_version = if attempt.reference.version.is_empty() {
            attempt.template.version.clone()
        } else {
            attempt.reference.version.clone()
        };
        let ctx = CommitContext {
            module_name: key.name.clone(),
            module_namespace: key.namespace.clone(),
            template_version,
            template_url: attempt.reference.source_url.clone(),
        };
        self.git.write(dest, &attempt.manifest, &ctx, &credentials).await
    }

    /// Kinds missing from the registry render as namespaced. Ask the cluster
    /// and move the ones it serves cluster-wide out of the target namespace.
    async fn scope_unknown_kinds(&self, manifest: &Arc<RenderedManifest>) -> Result<Arc<RenderedManifest>> {
        let registry = self.renderer.kinds();
        let mut cluster_scoped = HashSet::new();
        for (api_version, kind) in apply::manifest_kinds([manifest.as_ref()]) {
            if registry.get(&kind).is_some() {
                continue;
            }
            if self.cluster.is_namespaced(&api_version, &kind).await? == Some(false) {
                cluster_scoped.insert((api_version, kind));
            }
        }
        if cluster_scoped.is_empty() {
            return Ok(manifest.clone());
        }
        let resources = manifest
            .resources
            .iter()
            .cloned()
            .map(|r| {
                if cluster_scoped.contains(&(r.api_version.clone(), r.kind.clone())) {
                    r.without_namespace()
                } else {
                    r
                }
            })
            .collect();
        Ok(Arc::new(RenderedManifest::new(resources)))
    }

    /// Objects owned by `key` of any kind in the new or previous manifest,
    /// plus whatever currently occupies the identities of desired resources
    async fn live_state(
        &self,
        key: &ModuleKey,
        manifest: &RenderedManifest,
        previous: Option<&RenderedManifest>,
    ) -> Result<Vec<LiveObject>> {
        let kinds = apply::manifest_kinds(std::iter::once(manifest).chain(previous));
        let mut live = self.cluster.list_owned(&kinds, key).await?;
        let known: HashSet<_> = live.iter().map(|o| o.id.clone()).collect();
        for resource in &manifest.resources {
            let id = resource.id();
            if known.contains(&id) {
                continue;
            }
            if let Some(obj) = self.cluster.get(&id).await? {
                live.push(obj);
            }
        }
        Ok(live)
    }

    async fn record_success(&self, key: &ModuleKey, module: &Module, attempt: Attempt) -> ReconcileOutcome {
        let generation = module.metadata.generation;
        let (outcome, message) = match (&attempt.commit, &attempt.summary) {
            (Some(commit), _) if commit.created => (OUTCOME_COMMITTED, format!("Committed {}", commit.commit)),
            (Some(commit), _) => (OUTCOME_COMMITTED, format!("Up to date at {}", commit.commit)),
            (None, Some(summary)) => (OUTCOME_APPLIED, summary.to_string()),
            (None, None) => (OUTCOME_APPLIED, String::new()),
        };
        let commit_id = attempt.commit.as_ref().map(|c| c.commit.clone());

        let history = {
            let mut records = self.records();
            let record = records.entry(key.clone()).or_default();
            record.phase = ReconcilePhase::Succeeded;
            record.failures = 0;
            record.terminal_generation = None;
            record.last_good = Some(attempt.manifest.clone());

            let changed = record.history.back().map_or(true, |last| {
                last.content_hash != attempt.manifest.content_hash
                    || last.values != module.spec.values
                    || last.template != attempt.reference
                    || (commit_id.is_some() && last.commit != commit_id)
            });
            if changed {
                match attempt.manifest.to_yaml() {
                    Ok(manifest) => {
                        record.history.push_back(HistoryEntry {
                            manifest,
                            values: module.spec.values.clone(),
                            template: attempt.reference.clone(),
                            content_hash: attempt.manifest.content_hash.clone(),
                            timestamp: Utc::now().to_rfc3339(),
                            outcome: outcome.to_string(),
                            commit: commit_id.clone(),
                        });
                        while record.history.len() > self.config.history_limit.max(1) {
                            record.history.pop_front();
                        }
                    }
                    Err(e) => warn!("Failed to snapshot manifest of {}: {}", key, e),
                }
            }
            record.history.iter().cloned().collect::<Vec<_>>()
        };

        let mut status = module.status.clone().unwrap_or_default();
        status.phase = ReconcilePhase::Succeeded;
        status.message = Some(message.clone());
        status.reason = None;
        status.retryable = false;
        status.observed_generation = generation;
        status.last_applied_hash = Some(attempt.manifest.content_hash.clone());
        if commit_id.is_some() {
            status.last_commit = commit_id;
        }
        status.resolved_version = Some(attempt.template.revision.clone());
        status.failure_count = 0;
        status.history = history;
        conditions::mark_succeeded(&mut status.conditions, "Reconciled", &message, generation);

        info!("Reconciled {}: {}", key, message);
        if let Err(e) = self.store.update_status(key, &status).await {
            warn!("Failed to update status of {}: {}", key, e);
            return ReconcileOutcome::Retry(self.backoff(1));
        }
        if matches!(&attempt.commit, Some(c) if c.created) {
            self.event(module, EVENT_TYPE_NORMAL, "Committed", &message).await;
        }
        ReconcileOutcome::Succeeded
    }

    async fn record_failure(&self, key: &ModuleKey, module: &Module, err: Error) -> ReconcileOutcome {
        let retryable = err.is_retriable();
        let generation = module.metadata.generation;
        let failures = {
            let mut records = self.records();
            let record = records.entry(key.clone()).or_default();
            record.phase = ReconcilePhase::Failed;
            record.failures += 1;
            if !retryable {
                record.terminal_generation = generation;
            }
            record.failures
        };

        #[cfg(feature = "metrics")]
        super::metrics::inc_reconcile_error(err.reason());

        let message = err.to_string();
        if retryable {
            warn!("Reconcile of {} failed (attempt {}): {}", key, failures, message);
        } else {
            warn!("Reconcile of {} failed terminally: {}", key, message);
        }

        let mut status = module.status.clone().unwrap_or_default();
        status.phase = ReconcilePhase::Failed;
        status.message = Some(message.clone());
        status.reason = Some(err.reason().to_string());
        status.retryable = retryable;
        status.observed_generation = generation;
        status.failure_count = failures;
        conditions::mark_failed(&mut status.conditions, err.reason(), &message, retryable, generation);

        if let Err(e) = self.store.update_status(key, &status).await {
            warn!("Failed to update status of {}: {}", key, e);
        }
        self.event(module, EVENT_TYPE_WARNING, err.reason(), &message).await;

        if retryable {
            ReconcileOutcome::Retry(self.backoff(failures))
        } else {
            ReconcileOutcome::Terminal
        }
    }

    async fn event(&self, module: &Module, event_type: &str, reason: &str, message: &str) {
        if let Err(e) = self.store.emit_event(module, event_type, reason, message).await {
            debug!("Failed to emit event: {}", e);
        }
    }

    /// Final pass for a deleted Module: remove what it owns, release the
    /// finalizer and drop the bookkeeping
    async fn finalize(&self, key: &ModuleKey, module: &Module) -> ReconcileOutcome {
        if !has_finalizer(module) {
            self.forget(key);
            return ReconcileOutcome::Deleted;
        }
        if let Err(e) = self.cleanup(key, module).await {
            warn!("Cleanup of {} failed: {}", key, e);
            return ReconcileOutcome::Retry(self.backoff(self.bump_failures(key)));
        }
        if let Err(e) = self.store.remove_finalizer(module).await {
            warn!("Failed to remove finalizer from {}: {}", key, e);
            return ReconcileOutcome::Retry(self.backoff(self.bump_failures(key)));
        }
        self.forget(key);
        ReconcileOutcome::Deleted
    }

    async fn cleanup(&self, key: &ModuleKey, module: &Module) -> Result<()> {
        if self.is_git_ops(module).await {
            info!("{} writes to git, leaving cleanup to the repository", key);
            return Ok(());
        }
        self.seed(key, module);
        let Some(last_good) = self.rendered_manifest(key) else {
            debug!("{} never applied anything", key);
            return Ok(());
        };
        let kinds = apply::manifest_kinds([last_good.as_ref()]);
        let live = self.cluster.list_owned(&kinds, key).await?;
        let plan = apply::cleanup_plan(&live, key, self.renderer.kinds());
        let summary = apply::execute(self.cluster.as_ref(), &plan, key).await?;
        info!("Cleaned up {}: {} deleted", key, summary.deleted);
        Ok(())
    }

    async fn is_git_ops(&self, module: &Module) -> bool {
        if module.spec.git_ops_write.is_some() {
            return true;
        }
        let Some(store_name) = &module.spec.template.store_ref else {
            return false;
        };
        let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
        matches!(
            self.store.get_template_store(&namespace, store_name).await,
            Ok(Some(store)) if store.enforce_git_ops_write.is_some()
        )
    }
}
