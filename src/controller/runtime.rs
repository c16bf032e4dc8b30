//! Control loop runtime
//!
//! Module events from the cluster feed a [`WorkQueue`]; a fixed pool of
//! workers drains it through the [`Reconciler`]. Retryable failures are
//! re-queued with exponential backoff, and a periodic resync re-queues
//! every known Module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::ControllerHandle;
use super::queue::WorkQueue;
use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::crd::{Module, ModuleKey, TemplateSourceType};
use crate::error::{Error, Result};

const LEADERSHIP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before retry number `attempt` (0-based)
///
/// Exponential: `base * 2^attempt`, capped at `max`. Defaults to a 15 second
/// base and a 5 minute cap.
pub fn calculate_backoff(attempt: u32, base_delay_secs: Option<u64>, max_delay_secs: Option<u64>) -> Duration {
    let base = base_delay_secs.unwrap_or(15);
    let max = max_delay_secs.unwrap_or(300);

    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub max_concurrent_reconciles: usize,
    pub resync_interval: Duration,
    /// `None` watches every namespace
    pub watch_namespace: Option<String>,
    /// Extra namespace watched for Modules sourced from Helm repositories
    pub helm_watch_namespace: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
            resync_interval: Duration::from_secs(300),
            watch_namespace: None,
            helm_watch_namespace: None,
        }
    }
}

fn outcome_label(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Succeeded => "succeeded",
        ReconcileOutcome::Retry(_) => "retry",
        ReconcileOutcome::Terminal => "terminal",
        ReconcileOutcome::Deleted => "deleted",
    }
}

/// Start `count` workers draining `queue`; they exit when the queue shuts down.
/// Modules found gone are dropped from every filter in `filters`.
pub fn spawn_workers(
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    filters: Vec<Arc<Mutex<EventFilter>>>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let reconciler = reconciler.clone();
            let queue = queue.clone();
            let filters = filters.clone();
            tokio::spawn(async move {
                debug!("Worker {} started", id);
                while let Some(key) = queue.next().await {
                    let started = Instant::now();
                    let outcome = reconciler.reconcile(&key).await;
                    let elapsed = started.elapsed();
                    debug!(
                        "Worker {} finished {} in {:?}: {}",
                        id,
                        key,
                        elapsed,
                        outcome_label(&outcome)
                    );
                    #[cfg(feature = "metrics")]
                    super::metrics::observe_reconcile(outcome_label(&outcome), elapsed.as_secs_f64());

                    queue.done(&key);
                    match outcome {
                        ReconcileOutcome::Retry(delay) => queue.add_after(key, delay),
                        ReconcileOutcome::Deleted => {
                            for filter in &filters {
                                filter.lock().unwrap_or_else(|e| e.into_inner()).forget(&key);
                            }
                        }
                        _ => {}
                    }
                }
                debug!("Worker {} stopped", id);
            })
        })
        .collect()
}

/// Decides which watch events need a reconcile
///
/// Status and metadata-only updates leave `metadata.generation` unchanged and
/// are ignored; deletions (requested or completed) always pass.
#[derive(Debug, Default)]
pub struct EventFilter {
    generations: HashMap<ModuleKey, Option<i64>>,
    helm_only: bool,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only pass Modules whose template comes from a Helm repository
    pub fn helm_only() -> Self {
        Self {
            helm_only: true,
            ..Self::default()
        }
    }

    pub fn known_keys(&self) -> Vec<ModuleKey> {
        self.generations.keys().cloned().collect()
    }

    /// Stop tracking `key`, e.g. when its Delete event was missed across a relist
    pub fn forget(&mut self, key: &ModuleKey) -> bool {
        self.generations.remove(key).is_some()
    }

    fn accepts(&self, module: &Module) -> bool {
        !self.helm_only || module.spec.template.source_type == TemplateSourceType::HelmRepo
    }

    /// Keys to enqueue for `event`
    pub fn on_event(&mut self, event: watcher::Event<Module>) -> Option<ModuleKey> {
        match event {
            watcher::Event::Apply(module) | watcher::Event::InitApply(module) => {
                if !self.accepts(&module) {
                    return None;
                }
                let key = ModuleKey::from_module(&module);
                let generation = module.metadata.generation;
                let previous = self.generations.insert(key.clone(), generation);
                let changed = previous != Some(generation);
                (changed || module.metadata.deletion_timestamp.is_some()).then_some(key)
            }
            watcher::Event::Delete(module) => {
                let key = ModuleKey::from_module(&module);
                self.generations.remove(&key).map(|_| key)
            }
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }
}

pub struct ControllerRuntime {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: RuntimeConfig,
    known: Arc<Mutex<EventFilter>>,
}

impl ControllerRuntime {
    pub fn new(reconciler: Arc<Reconciler>, config: RuntimeConfig) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(),
            config,
            known: Arc::new(Mutex::new(EventFilter::new())),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.reconciler.clone(), self.queue.clone())
    }

    /// Watch Modules and reconcile them until the watch ends or, when
    /// `is_leader` is given, leadership is lost
    pub async fn run(self, client: Client, is_leader: Option<Arc<AtomicBool>>) -> Result<()> {
        if let Some(flag) = &is_leader {
            info!("Waiting for leadership before starting workers");
            while !flag.load(Ordering::Relaxed) {
                tokio::time::sleep(LEADERSHIP_POLL_INTERVAL).await;
            }
        }

        let modules: Api<Module> = match &self.config.watch_namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        if let Err(e) = modules.list(&Default::default()).await {
            error!("Module CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Module CRD not installed".to_string()));
        }

        info!(
            "Starting Module controller with {} worker(s), watching {}",
            self.config.max_concurrent_reconciles,
            self.config.watch_namespace.as_deref().unwrap_or("all namespaces")
        );
        let helm_filter = self
            .config
            .helm_watch_namespace
            .as_ref()
            .map(|_| Arc::new(Mutex::new(EventFilter::helm_only())));
        let filters = std::iter::once(self.known.clone())
            .chain(helm_filter.clone())
            .collect();
        let mut tasks = spawn_workers(
            self.reconciler.clone(),
            self.queue.clone(),
            filters,
            self.config.max_concurrent_reconciles,
        );

        let main_watch = watcher(modules, watcher::Config::default()).default_backoff();
        tasks.push(tokio::spawn(feed_queue(main_watch, self.known.clone(), self.queue.clone())));

        if let (Some(ns), Some(filter)) = (&self.config.helm_watch_namespace, helm_filter) {
            info!("Also watching Helm repository Modules in {}", ns);
            let helm_modules: Api<Module> = Api::namespaced(client.clone(), ns);
            let helm_watch = watcher(helm_modules, watcher::Config::default()).default_backoff();
            tasks.push(tokio::spawn(resync(filter.clone(), self.queue.clone(), self.config.resync_interval)));
            tasks.push(tokio::spawn(feed_queue(helm_watch, filter, self.queue.clone())));
        }

        tasks.push(tokio::spawn(resync(
            self.known.clone(),
            self.queue.clone(),
            self.config.resync_interval,
        )));

        #[cfg(feature = "metrics")]
        tasks.push(tokio::spawn(refresh_metrics(self.reconciler.clone(), self.queue.clone())));

        let result = match is_leader {
            Some(flag) => {
                loop {
                    tokio::time::sleep(LEADERSHIP_POLL_INTERVAL).await;
                    if !flag.load(Ordering::Relaxed) {
                        break;
                    }
                }
                warn!("Leadership lost, stopping controller");
                Err(Error::ConfigError("leadership lost".to_string()))
            }
            None => {
                tokio::signal::ctrl_c().await?;
                info!("Shutdown signal received");
                Ok(())
            }
        };

        self.queue.shutdown();
        for task in tasks {
            task.abort();
        }
        result
    }
}

async fn feed_queue<S>(stream: S, filter: Arc<Mutex<EventFilter>>, queue: Arc<WorkQueue>)
where
    S: Stream<Item = std::result::Result<watcher::Event<Module>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                let key = filter.lock().unwrap_or_else(|e| e.into_inner()).on_event(event);
                if let Some(key) = key {
                    debug!("Queueing {}", key);
                    queue.add(key);
                }
            }
            Err(e) => warn!("Module watch error: {}", e),
        }
    }
    warn!("Module watch stream ended");
}

async fn resync(filter: Arc<Mutex<EventFilter>>, queue: Arc<WorkQueue>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick completes immediately
    loop {
        ticker.tick().await;
        let keys = filter.lock().unwrap_or_else(|e| e.into_inner()).known_keys();
        debug!("Resync of {} Module(s)", keys.len());
        for key in keys {
            queue.add(key);
        }
    }
}

#[cfg(feature = "metrics")]
async fn refresh_metrics(reconciler: Arc<Reconciler>, queue: Arc<WorkQueue>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        super::metrics::set_cache_stats(reconciler.templates().cache_stats());
        super::metrics::set_queue_depth(queue.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ModuleSpec, ModuleTemplateRef};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, None, None), Duration::from_secs(60));
        assert_eq!(calculate_backoff(3, None, None), Duration::from_secs(120));
        assert_eq!(calculate_backoff(4, None, None), Duration::from_secs(240));
        // capped at 300 s (5 min)
        assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(10, None, None), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_custom_bounds() {
        assert_eq!(calculate_backoff(0, Some(1), Some(4)), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3, Some(1), Some(4)), Duration::from_secs(4));
    }

    fn module(name: &str, generation: i64, source_type: TemplateSourceType) -> Module {
        let mut m = Module::new(
            name,
            ModuleSpec {
                template: ModuleTemplateRef {
                    repo: "https://charts.example.com".into(),
                    source_type,
                    ..Default::default()
                },
                values: serde_json::Value::Null,
                target_namespace: None,
                git_ops_write: None,
            },
        );
        m.metadata.namespace = Some("apps".into());
        m.metadata.generation = Some(generation);
        m
    }

    #[test]
    fn test_event_filter_ignores_status_only_updates() {
        let mut filter = EventFilter::new();
        let m = module("web", 1, TemplateSourceType::Git);

        assert_eq!(filter.on_event(watcher::Event::InitApply(m.clone())), Some(ModuleKey::new("apps", "web")));
        assert_eq!(filter.on_event(watcher::Event::Apply(m.clone())), None);

        let changed = module("web", 2, TemplateSourceType::Git);
        assert!(filter.on_event(watcher::Event::Apply(changed)).is_some());
    }

    #[test]
    fn test_event_filter_passes_deletions() {
        let mut filter = EventFilter::new();
        let mut m = module("web", 1, TemplateSourceType::Git);
        filter.on_event(watcher::Event::Apply(m.clone()));

        m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(filter.on_event(watcher::Event::Apply(m.clone())).is_some());
        assert!(filter.on_event(watcher::Event::Delete(m)).is_some());
        assert!(filter.known_keys().is_empty());
    }

    #[test]
    fn test_event_filter_forget() {
        let mut filter = EventFilter::new();
        filter.on_event(watcher::Event::Apply(module("web", 1, TemplateSourceType::Git)));

        assert!(filter.forget(&ModuleKey::new("apps", "web")));
        assert!(!filter.forget(&ModuleKey::new("apps", "web")));
        assert!(filter.known_keys().is_empty());
    }

    #[test]
    fn test_helm_filter_skips_other_sources() {
        let mut filter = EventFilter::helm_only();
        assert!(filter
            .on_event(watcher::Event::Apply(module("git", 1, TemplateSourceType::Git)))
            .is_none());
        assert!(filter
            .on_event(watcher::Event::Apply(module("chart", 1, TemplateSourceType::HelmRepo)))
            .is_some());
        assert_eq!(filter.known_keys(), vec![ModuleKey::new("apps", "chart")]);
    }
}
