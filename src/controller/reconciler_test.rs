//! Tests for the reconciler module
//!
//! These tests drive the reconciler against in-memory fakes of the Module
//! store, the cluster, the template source and the git remote, and verify:
//! - Resource creation and namespace stamping
//! - Idempotence of repeated reconciles
//! - Updates, deletions and cleanup of owned resources
//! - Error classification, backoff and preservation of the last good state
//! - GitOps write-back and the concurrency bound of the worker pool

#[cfg(test)]
mod tests {
    use super::super::cluster::{ClusterClient, LiveObject, MODULE_LABEL};
    use super::super::handle::ControllerHandle;
    use super::super::queue::WorkQueue;
    use super::super::reconciler::*;
    use super::super::runtime::{calculate_backoff, spawn_workers, EventFilter};
    use super::super::store::ModuleStore;
    use super::super::MODULE_FINALIZER;
    use crate::auth::{Credentials, CredentialsResolver, SecretStore};
    use crate::crd::{
        GitOpsWriteDestination, Module, ModuleKey, ModuleSpec, ModuleStatus, ModuleTemplateRef,
        ReconcilePhase, TemplateAuthRuleSpec, TemplateRef, TemplateSourceType, TemplateStoreSpec,
    };
    use crate::error::{Error, Result};
    use crate::gitops::{BranchSnapshot, GitBackend, GitWriteClient, PushOutcome, DEFAULT_COMMIT_MESSAGE_TEMPLATE};
    use crate::template::render::ResourceId;
    use crate::template::{TemplateCache, TemplateFetcher, TemplateRepository, TemplateSource};
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher;
    use kube::ResourceExt;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ Release.Name }}
spec:
  replicas: {{ Values.replicas }}
"#;

    const SERVICE: &str = r#"{% if Values.service.enabled %}
apiVersion: v1
kind: Service
metadata:
  name: {{ Release.Name }}
spec:
  ports:
    - port: {{ Values.service.port }}
{% endif %}
"#;

    const CLUSTER_ISSUER: &str = r#"apiVersion: cert-manager.io/v1
kind: ClusterIssuer
metadata:
  name: {{ Release.Name }}-issuer
spec:
  selfSigned: {}
"#;

    const DEFAULTS: &str = "replicas: 1\nservice:\n  enabled: true\n  port: 80\n";

    const SCHEMA: &str = r#"{"type": "object", "properties": {"replicas": {"type": "integer", "minimum": 0}}}"#;

    // ── fakes ──────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeStore {
        modules: Mutex<HashMap<ModuleKey, Module>>,
        template_stores: Mutex<HashMap<String, TemplateStoreSpec>>,
        events: Mutex<Vec<(String, String)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl FakeStore {
        fn insert(&self, module: Module) {
            let key = ModuleKey::from_module(&module);
            self.modules.lock().unwrap().insert(key, module);
        }

        fn module(&self, key: &ModuleKey) -> Module {
            self.modules.lock().unwrap().get(key).cloned().unwrap()
        }

        fn status(&self, key: &ModuleKey) -> ModuleStatus {
            self.module(key).status.unwrap_or_default()
        }

        fn edit(&self, key: &ModuleKey, f: impl FnOnce(&mut Module)) {
            let mut modules = self.modules.lock().unwrap();
            let module = modules.get_mut(key).unwrap();
            f(module);
        }
    }

    #[async_trait]
    impl ModuleStore for FakeStore {
        async fn get_module(&self, key: &ModuleKey) -> Result<Option<Module>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            Ok(self.modules.lock().unwrap().get(key).cloned())
        }

        async fn get_template_store(&self, _: &str, name: &str) -> Result<Option<TemplateStoreSpec>> {
            Ok(self.template_stores.lock().unwrap().get(name).cloned())
        }

        async fn update_status(&self, key: &ModuleKey, status: &ModuleStatus) -> Result<()> {
            self.active.fetch_sub(1, Ordering::SeqCst);
            if let Some(module) = self.modules.lock().unwrap().get_mut(key) {
                module.status = Some(status.clone());
            }
            Ok(())
        }

        async fn add_finalizer(&self, module: &Module) -> Result<()> {
            let key = ModuleKey::from_module(module);
            self.edit(&key, |m| {
                m.metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(MODULE_FINALIZER.to_string())
            });
            Ok(())
        }

        async fn remove_finalizer(&self, module: &Module) -> Result<()> {
            // The API server finishes the deletion once the last finalizer is gone
            self.modules
                .lock()
                .unwrap()
                .remove(&ModuleKey::from_module(module));
            Ok(())
        }

        async fn emit_event(&self, _: &Module, event_type: &str, reason: &str, _: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event_type.to_string(), reason.to_string()));
            Ok(())
        }

        async fn patch_spec(&self, key: &ModuleKey, template: &ModuleTemplateRef, values: &Value) -> Result<()> {
            self.edit(key, |m| {
                m.spec.template = template.clone();
                m.spec.values = values.clone();
                m.metadata.generation = Some(m.metadata.generation.unwrap_or(0) + 1);
            });
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCluster {
        objects: Mutex<BTreeMap<ResourceId, Value>>,
        creates: AtomicUsize,
        updates: AtomicUsize,
        deletes: AtomicUsize,
        next_rv: AtomicUsize,
        write_delay: Mutex<Option<Duration>>,
        /// Kinds the fake API server treats as cluster-scoped
        cluster_kinds: Vec<&'static str>,
    }

    impl FakeCluster {
        fn writes(&self) -> (usize, usize, usize) {
            (
                self.creates.load(Ordering::SeqCst),
                self.updates.load(Ordering::SeqCst),
                self.deletes.load(Ordering::SeqCst),
            )
        }

        fn find(&self, kind: &str, name: &str) -> Option<Value> {
            self.objects
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id.kind == kind && id.name == name)
                .map(|(_, body)| body.clone())
        }

        fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        /// Identity as the API server sees it: cluster-scoped objects have no namespace
        fn server_id(&self, id: &ResourceId) -> ResourceId {
            let mut id = id.clone();
            if self.cluster_kinds.iter().any(|k| *k == id.kind) {
                id.namespace = None;
            }
            id
        }

        fn store(&self, id: &ResourceId, body: &Value) {
            let id = self.server_id(id);
            let mut body = body.clone();
            if id.namespace.is_none() {
                if let Some(meta) = body["metadata"].as_object_mut() {
                    meta.remove("namespace");
                }
            }
            let rv = self.next_rv.fetch_add(1, Ordering::SeqCst) + 1;
            body["metadata"]["resourceVersion"] = Value::String(rv.to_string());
            self.objects.lock().unwrap().insert(id, body);
        }

        async fn pause(&self) {
            let delay = *self.write_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn get(&self, id: &ResourceId) -> Result<Option<LiveObject>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&self.server_id(id))
                .cloned()
                .and_then(LiveObject::from_body))
        }

        async fn is_namespaced(&self, _: &str, kind: &str) -> Result<Option<bool>> {
            Ok(Some(!self.cluster_kinds.iter().any(|k| *k == kind)))
        }

        async fn list_owned(&self, kinds: &[(String, String)], owner: &ModuleKey) -> Result<Vec<LiveObject>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| kinds.iter().any(|(a, k)| *a == id.api_version && *k == id.kind))
                .filter_map(|(_, body)| LiveObject::from_body(body.clone()))
                .filter(|obj| obj.is_owned_by(owner))
                .collect())
        }

        async fn create(&self, id: &ResourceId, body: &Value) -> Result<()> {
            self.pause().await;
            if self.objects.lock().unwrap().contains_key(&self.server_id(id)) {
                return Err(Error::ApplyConflict {
                    resource: id.to_string(),
                    message: "already exists".into(),
                });
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.store(id, body);
            Ok(())
        }

        async fn update(&self, id: &ResourceId, body: &Value) -> Result<()> {
            self.pause().await;
            let current = self
                .objects
                .lock()
                .unwrap()
                .get(&self.server_id(id))
                .map(|b| b["metadata"]["resourceVersion"].clone());
            if current.is_some() && current.as_ref() != Some(&body["metadata"]["resourceVersion"]) {
                return Err(Error::ApplyConflict {
                    resource: id.to_string(),
                    message: "resourceVersion mismatch".into(),
                });
            }
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.store(id, body);
            Ok(())
        }

        async fn delete(&self, id: &ResourceId) -> Result<()> {
            if self.objects.lock().unwrap().remove(&self.server_id(id)).is_some() {
                self.deletes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct FakeFetcher {
        calls: Arc<AtomicUsize>,
        unreachable: Arc<AtomicBool>,
        extra_files: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl TemplateFetcher for FakeFetcher {
        fn source_type(&self) -> TemplateSourceType {
            TemplateSourceType::Git
        }

        async fn fetch(&self, reference: &TemplateRef, _: &Credentials) -> Result<TemplateSource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(Error::unreachable(&reference.source_url, "connection refused"));
            }
            let files = [
                ("Chart.yaml", "name: app\nversion: 1.0.0\n"),
                ("values.yaml", DEFAULTS),
                ("values.schema.json", SCHEMA),
                ("templates/deployment.yaml", DEPLOYMENT),
                ("templates/service.yaml", SERVICE),
            ]
            .into_iter()
            .map(|(path, body)| (path.to_string(), body.as_bytes().to_vec()))
            .chain(
                self.extra_files
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(path, body)| (path.clone(), body.as_bytes().to_vec())),
            )
            .collect();
            Ok(TemplateSource {
                files,
                revision: "0123abcd".into(),
            })
        }
    }

    struct NoRules;

    #[async_trait]
    impl SecretStore for NoRules {
        async fn get_secret(&self, _: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
            Ok(None)
        }

        async fn list_auth_rules(&self) -> Result<Vec<TemplateAuthRuleSpec>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeGit {
        commits: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl GitBackend for FakeGit {
        async fn snapshot(&self, _: &GitOpsWriteDestination, file: &str, _: &Credentials) -> Result<BranchSnapshot> {
            let commits = self.commits.lock().unwrap();
            Ok(BranchSnapshot {
                commit: (!commits.is_empty()).then(|| format!("c{}", commits.len())),
                content: commits
                    .iter()
                    .rev()
                    .find(|(f, _, _)| f == file)
                    .map(|(_, _, content)| content.clone()),
            })
        }

        async fn commit(
            &self,
            _: &GitOpsWriteDestination,
            file: &str,
            _: &Credentials,
            _: &BranchSnapshot,
            content: &[u8],
            message: &str,
        ) -> Result<PushOutcome> {
            let mut commits = self.commits.lock().unwrap();
            commits.push((file.to_string(), message.to_string(), content.to_vec()));
            Ok(PushOutcome::Pushed {
                commit: format!("c{}", commits.len()),
            })
        }
    }

    struct Harness {
        reconciler: Arc<Reconciler>,
        store: Arc<FakeStore>,
        cluster: Arc<FakeCluster>,
        git: Arc<FakeGit>,
        fetches: Arc<AtomicUsize>,
        unreachable: Arc<AtomicBool>,
        extra_files: Arc<Mutex<Vec<(String, String)>>>,
    }

    fn harness_with(cluster: FakeCluster) -> Harness {
        harness_with_config(cluster, ReconcilerConfig::default())
    }

    fn harness_with_config(cluster: FakeCluster, config: ReconcilerConfig) -> Harness {
        let store = Arc::new(FakeStore::default());
        let cluster = Arc::new(cluster);
        let git = Arc::new(FakeGit::default());
        let fetches = Arc::new(AtomicUsize::new(0));
        let unreachable = Arc::new(AtomicBool::new(false));
        let extra_files = Arc::new(Mutex::new(Vec::new()));
        let repository = TemplateRepository::new(
            TemplateCache::new(),
            vec![Box::new(FakeFetcher {
                calls: fetches.clone(),
                unreachable: unreachable.clone(),
                extra_files: extra_files.clone(),
            })],
        );
        let reconciler = Reconciler::new(
            store.clone(),
            cluster.clone(),
            CredentialsResolver::new(Arc::new(NoRules)),
            Arc::new(repository),
            Arc::new(GitWriteClient::new(git.clone(), DEFAULT_COMMIT_MESSAGE_TEMPLATE)),
            config,
        );
        Harness {
            reconciler: Arc::new(reconciler),
            store,
            cluster,
            git,
            fetches,
            unreachable,
            extra_files,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeCluster::default())
    }

    /// Helper to create a test Module rendered into `team-a`
    fn create_test_module(name: &str, values: Value) -> Module {
        Module {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("apps".to_string()),
                generation: Some(1),
                uid: Some(format!("test-uid-{name}")),
                ..Default::default()
            },
            spec: ModuleSpec {
                template: ModuleTemplateRef {
                    repo: "https://github.com/x/charts".into(),
                    path: "app".into(),
                    version: "v1".into(),
                    source_type: TemplateSourceType::Git,
                    store_ref: None,
                },
                values,
                target_namespace: Some("team-a".into()),
                git_ops_write: None,
            },
            status: None,
        }
    }

    fn set_values(h: &Harness, key: &ModuleKey, values: Value) {
        h.store.edit(key, |m| {
            m.spec.values = values;
            m.metadata.generation = Some(m.metadata.generation.unwrap_or(0) + 1);
        });
    }

    // ── apply path ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reconcile_creates_resources_in_target_namespace() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");

        let outcome = h.reconciler.reconcile(&key).await;

        assert_eq!(outcome, ReconcileOutcome::Succeeded);
        assert_eq!(h.cluster.writes(), (2, 0, 0));
        let deployment = h.cluster.find("Deployment", "web").unwrap();
        assert_eq!(deployment["spec"]["replicas"], 3);
        assert_eq!(deployment["metadata"]["namespace"], "team-a");
        assert_eq!(deployment["metadata"]["labels"][MODULE_LABEL], "web");

        let module = h.store.module(&key);
        assert!(module.finalizers().contains(&MODULE_FINALIZER.to_string()));
        let status = module.status.unwrap();
        assert_eq!(status.phase, ReconcilePhase::Succeeded);
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].outcome, "Applied");
        assert_eq!(status.resolved_version.as_deref(), Some("0123abcd"));
        assert_eq!(h.reconciler.phase(&key), Some(ReconcilePhase::Succeeded));
    }

    #[tokio::test]
    async fn test_second_reconcile_produces_no_diffs() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");

        h.reconciler.reconcile(&key).await;
        let after_first = h.cluster.writes();
        let outcome = h.reconciler.reconcile(&key).await;

        assert_eq!(outcome, ReconcileOutcome::Succeeded);
        assert_eq!(h.cluster.writes(), after_first);
        assert_eq!(h.store.status(&key).history.len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_scoped_custom_kind_is_stable_across_reconciles() {
        let h = harness_with(FakeCluster {
            cluster_kinds: vec!["ClusterIssuer"],
            ..Default::default()
        });
        h.extra_files
            .lock()
            .unwrap()
            .push(("templates/issuer.yaml".into(), CLUSTER_ISSUER.into()));
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");

        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);
        assert_eq!(h.cluster.writes(), (3, 0, 0));
        let issuer = h.cluster.find("ClusterIssuer", "web-issuer").unwrap();
        assert!(issuer["metadata"].get("namespace").is_none());

        for _ in 0..2 {
            assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);
        }
        assert_eq!(h.cluster.writes(), (3, 0, 0));
        assert!(h.cluster.find("ClusterIssuer", "web-issuer").is_some());

        let manifest = h.reconciler.rendered_manifest(&key).unwrap();
        let issuer = manifest.resources.iter().find(|r| r.kind == "ClusterIssuer").unwrap();
        assert_eq!(issuer.namespace, None);
        assert_eq!(h.store.status(&key).history.len(), 1);
    }

    #[tokio::test]
    async fn test_replica_change_triggers_exactly_one_update() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;
        let first_hash = h.reconciler.rendered_manifest(&key).unwrap().content_hash.clone();

        set_values(&h, &key, json!({"replicas": 4}));
        let outcome = h.reconciler.reconcile(&key).await;

        assert_eq!(outcome, ReconcileOutcome::Succeeded);
        assert_eq!(h.cluster.writes(), (2, 1, 0));
        assert_eq!(h.cluster.find("Deployment", "web").unwrap()["spec"]["replicas"], 4);
        assert_ne!(h.reconciler.rendered_manifest(&key).unwrap().content_hash, first_hash);
        assert_eq!(h.store.status(&key).history.len(), 2);
    }

    #[tokio::test]
    async fn test_resource_dropped_from_manifest_is_deleted() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;

        set_values(&h, &key, json!({"replicas": 3, "service": {"enabled": false}}));
        h.reconciler.reconcile(&key).await;

        assert_eq!(h.cluster.writes(), (2, 0, 1));
        assert!(h.cluster.find("Service", "web").is_none());
        assert!(h.cluster.find("Deployment", "web").is_some());
    }

    #[tokio::test]
    async fn test_resource_owned_by_other_module_is_terminal() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let mut twin = create_test_module("twin", json!({}));
        twin.metadata.name = Some("web".into());
        twin.metadata.namespace = Some("other".into());
        h.store.insert(twin);

        assert_eq!(h.reconciler.reconcile(&ModuleKey::new("apps", "web")).await, ReconcileOutcome::Succeeded);
        // Same release name and target namespace: renders the same identities
        let outcome = h.reconciler.reconcile(&ModuleKey::new("other", "web")).await;

        assert_eq!(outcome, ReconcileOutcome::Terminal);
        assert_eq!(h.cluster.writes(), (2, 0, 0));
    }

    #[tokio::test]
    async fn test_template_fetched_once_for_modules_sharing_it() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 1})));
        h.store.insert(create_test_module("api", json!({"replicas": 2})));

        h.reconciler.reconcile(&ModuleKey::new("apps", "web")).await;
        h.reconciler.reconcile(&ModuleKey::new("apps", "api")).await;
        h.reconciler.reconcile(&ModuleKey::new("apps", "web")).await;

        assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
        let stats = h.reconciler.templates().cache_stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    // ── failures ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_schema_violation_is_terminal_and_keeps_last_good() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;
        let good = h.reconciler.rendered_manifest(&key).unwrap();

        set_values(&h, &key, json!({"replicas": "three"}));
        let outcome = h.reconciler.reconcile(&key).await;

        assert_eq!(outcome, ReconcileOutcome::Terminal);
        assert_eq!(h.reconciler.rendered_manifest(&key).unwrap(), good);
        assert_eq!(h.cluster.writes(), (2, 0, 0));
        let status = h.store.status(&key);
        assert_eq!(status.phase, ReconcilePhase::Failed);
        assert_eq!(status.reason.as_deref(), Some("SchemaValidationError"));
        assert!(status.message.unwrap().contains("values.replicas"));
        assert!(!status.retryable);
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.last_applied_hash.as_deref(), Some(good.content_hash.as_str()));
        assert!(h
            .store
            .events
            .lock()
            .unwrap()
            .contains(&("Warning".to_string(), "SchemaValidationError".to_string())));
    }

    #[tokio::test]
    async fn test_terminal_failure_waits_for_spec_change_or_trigger() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": -1})));
        let key = ModuleKey::new("apps", "web");

        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Terminal);
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Terminal);
        assert_eq!(h.store.status(&key).failure_count, 1);

        let handle = ControllerHandle::new(h.reconciler.clone(), WorkQueue::new());
        handle.trigger_reconcile(&key);
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Terminal);
        assert_eq!(h.store.status(&key).failure_count, 2);

        set_values(&h, &key, json!({"replicas": 2}));
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);
        assert_eq!(h.store.status(&key).failure_count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_retried_with_backoff() {
        let h = harness();
        h.unreachable.store(true, Ordering::SeqCst);
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");

        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Retry(Duration::from_secs(15)));
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Retry(Duration::from_secs(30)));
        let status = h.store.status(&key);
        assert!(status.retryable);
        assert_eq!(status.reason.as_deref(), Some("SourceUnreachable"));
        assert_eq!(status.failure_count, 2);

        h.unreachable.store(false, Ordering::SeqCst);
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);
        assert_eq!(h.store.status(&key).failure_count, 0);
        // Failed fetches were not cached
        assert_eq!(h.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_apply_conflict_is_retryable() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;

        // Someone else bumps the Deployment between our read and write
        set_values(&h, &key, json!({"replicas": 5}));
        {
            let mut objects = h.cluster.objects.lock().unwrap();
            for body in objects.values_mut() {
                body["metadata"]["resourceVersion"] = json!("999");
            }
        }
        let stale = FakeClusterRace(h.cluster.clone());
        let reconciler = Reconciler::new(
            h.store.clone(),
            Arc::new(stale),
            CredentialsResolver::new(Arc::new(NoRules)),
            h.reconciler.templates().clone(),
            Arc::new(GitWriteClient::new(h.git.clone(), DEFAULT_COMMIT_MESSAGE_TEMPLATE)),
            ReconcilerConfig::default(),
        );

        match reconciler.reconcile(&key).await {
            ReconcileOutcome::Retry(_) => {}
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(h.store.status(&key).reason.as_deref(), Some("ApplyConflict"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_past_deadline_is_abandoned_and_retried() {
        let config = ReconcilerConfig {
            attempt_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let h = harness_with_config(FakeCluster::default(), config.clone());
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);
        let good = h.reconciler.rendered_manifest(&key).unwrap();

        // The API server stalls far past the deadline
        *h.cluster.write_delay.lock().unwrap() = Some(Duration::from_secs(600));
        set_values(&h, &key, json!({"replicas": 4}));
        let outcome = h.reconciler.reconcile(&key).await;

        assert_eq!(
            outcome,
            ReconcileOutcome::Retry(calculate_backoff(
                0,
                Some(config.backoff_base_secs),
                Some(config.backoff_max_secs)
            ))
        );
        let status = h.store.status(&key);
        assert_eq!(status.phase, ReconcilePhase::Failed);
        assert_eq!(status.reason.as_deref(), Some("Timeout"));
        assert!(status.retryable);
        assert_eq!(status.history.len(), 1);
        assert_eq!(h.reconciler.rendered_manifest(&key).unwrap(), good);
        assert_eq!(h.cluster.writes(), (2, 0, 0));
        assert_eq!(h.cluster.find("Deployment", "web").unwrap()["spec"]["replicas"], 3);
    }

    /// Cluster whose reads return a stale resourceVersion
    struct FakeClusterRace(Arc<FakeCluster>);

    #[async_trait]
    impl ClusterClient for FakeClusterRace {
        async fn get(&self, id: &ResourceId) -> Result<Option<LiveObject>> {
            self.0.get(id).await
        }

        async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>> {
            self.0.is_namespaced(api_version, kind).await
        }

        async fn list_owned(&self, kinds: &[(String, String)], owner: &ModuleKey) -> Result<Vec<LiveObject>> {
            let mut live = self.0.list_owned(kinds, owner).await?;
            for obj in &mut live {
                obj.resource_version = Some("1".into());
            }
            Ok(live)
        }

        async fn create(&self, id: &ResourceId, body: &Value) -> Result<()> {
            self.0.create(id, body).await
        }

        async fn update(&self, id: &ResourceId, body: &Value) -> Result<()> {
            self.0.update(id, body).await
        }

        async fn delete(&self, id: &ResourceId) -> Result<()> {
            self.0.delete(id).await
        }
    }

    // ── GitOps ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_git_ops_module_commits_instead_of_applying() {
        let h = harness();
        let mut module = create_test_module("web", json!({"replicas": 3}));
        module.spec.git_ops_write = Some(GitOpsWriteDestination {
            repo: "https://github.com/x/gitops".into(),
            path: "clusters/prod".into(),
            branch: "main".into(),
        });
        h.store.insert(module);
        let key = ModuleKey::new("apps", "web");

        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);
        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Succeeded);

        assert_eq!(h.cluster.len(), 0);
        let commits = h.git.commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, "clusters/prod/web.yaml");
        assert_eq!(commits[0].1, "Update apps/web to v1");
        let yaml = String::from_utf8(commits[0].2.clone()).unwrap();
        assert!(yaml.contains("replicas: 3"));

        let status = h.store.status(&key);
        assert_eq!(status.last_commit.as_deref(), Some("c1"));
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].outcome, "Committed");
        assert_eq!(status.history[0].commit.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_store_enforced_destination_overrides_module() {
        let h = harness();
        h.store.template_stores.lock().unwrap().insert(
            "app-store".into(),
            TemplateStoreSpec {
                repo: "https://github.com/x/charts".into(),
                path: "app".into(),
                version: "v2".into(),
                source_type: TemplateSourceType::Git,
                enforce_git_ops_write: Some(GitOpsWriteDestination {
                    repo: "https://github.com/x/gitops".into(),
                    path: "enforced.yaml".into(),
                    branch: "main".into(),
                }),
            },
        );
        let mut module = create_test_module("web", json!({"replicas": 2}));
        module.spec.template = ModuleTemplateRef {
            store_ref: Some("app-store".into()),
            ..Default::default()
        };
        h.store.insert(module);

        let outcome = h.reconciler.reconcile(&ModuleKey::new("apps", "web")).await;

        assert_eq!(outcome, ReconcileOutcome::Succeeded);
        assert_eq!(h.cluster.len(), 0);
        let commits = h.git.commits.lock().unwrap();
        assert_eq!(commits[0].0, "enforced.yaml");
        assert_eq!(commits[0].1, "Update apps/web to v2");
    }

    #[tokio::test]
    async fn test_missing_store_is_terminal() {
        let h = harness();
        let mut module = create_test_module("web", json!({}));
        module.spec.template.store_ref = Some("absent".into());
        h.store.insert(module);

        let outcome = h.reconciler.reconcile(&ModuleKey::new("apps", "web")).await;

        assert_eq!(outcome, ReconcileOutcome::Terminal);
    }

    // ── deletion ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_deletion_removes_owned_resources_and_bookkeeping() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;
        assert_eq!(h.cluster.len(), 2);

        h.store
            .edit(&key, |m| m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now())));
        let outcome = h.reconciler.reconcile(&key).await;

        assert_eq!(outcome, ReconcileOutcome::Deleted);
        assert_eq!(h.cluster.len(), 0);
        assert!(h.store.modules.lock().unwrap().get(&key).is_none());
        assert!(h.reconciler.rendered_manifest(&key).is_none());
        assert!(h.reconciler.phase(&key).is_none());
    }

    #[tokio::test]
    async fn test_deletion_after_restart_uses_status_history() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;

        // A fresh reconciler only knows what the status recorded
        let fresh = harness_with(FakeCluster::default());
        for (id, body) in h.cluster.objects.lock().unwrap().iter() {
            fresh.cluster.objects.lock().unwrap().insert(id.clone(), body.clone());
        }
        let mut module = h.store.module(&key);
        module.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        fresh.store.insert(module);

        assert_eq!(fresh.reconciler.reconcile(&key).await, ReconcileOutcome::Deleted);
        assert_eq!(fresh.cluster.len(), 0);
    }

    #[tokio::test]
    async fn test_deletion_of_git_ops_module_leaves_repository_alone() {
        let h = harness();
        let mut module = create_test_module("web", json!({"replicas": 3}));
        module.spec.git_ops_write = Some(GitOpsWriteDestination {
            repo: "https://github.com/x/gitops".into(),
            path: "web.yaml".into(),
            branch: "main".into(),
        });
        h.store.insert(module);
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;

        h.store
            .edit(&key, |m| m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now())));

        assert_eq!(h.reconciler.reconcile(&key).await, ReconcileOutcome::Deleted);
        assert_eq!(h.git.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_module_is_forgotten() {
        let h = harness();
        let outcome = h.reconciler.reconcile(&ModuleKey::new("apps", "gone")).await;
        assert_eq!(outcome, ReconcileOutcome::Deleted);
    }

    // ── exposed operations ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_rollback_restores_previous_values() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        h.reconciler.reconcile(&key).await;
        set_values(&h, &key, json!({"replicas": 4}));
        h.reconciler.reconcile(&key).await;

        let queue = WorkQueue::new();
        let handle = ControllerHandle::new(h.reconciler.clone(), queue.clone());
        let entry = handle.rollback(&key, 0).await.unwrap();

        assert_eq!(entry.values, json!({"replicas": 3}));
        assert_eq!(h.store.module(&key).spec.values, json!({"replicas": 3}));
        assert_eq!(queue.len(), 1);

        h.reconciler.reconcile(&key).await;
        assert_eq!(h.cluster.find("Deployment", "web").unwrap()["spec"]["replicas"], 3);
        assert!(handle.rollback(&key, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_handle_reads_manifest_and_history() {
        let h = harness();
        h.store.insert(create_test_module("web", json!({"replicas": 3})));
        let key = ModuleKey::new("apps", "web");
        let handle = ControllerHandle::new(h.reconciler.clone(), WorkQueue::new());

        assert!(handle.rendered_manifest(&key).await.unwrap().is_none());
        h.reconciler.reconcile(&key).await;

        let manifest = handle.rendered_manifest(&key).await.unwrap().unwrap();
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(handle.history(&key).await.unwrap().len(), 1);
        assert_eq!(handle.cache_stats().misses, 1);
        assert_eq!(handle.module_phase(&key), Some(ReconcilePhase::Succeeded));
    }

    // ── concurrency ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrent_reconciles() {
        let h = harness_with(FakeCluster {
            write_delay: Mutex::new(Some(Duration::from_millis(10))),
            ..Default::default()
        });
        let keys: Vec<_> = (0..6)
            .map(|i| {
                let module = create_test_module(&format!("web-{i}"), json!({"replicas": i}));
                let key = ModuleKey::from_module(&module);
                h.store.insert(module);
                key
            })
            .collect();

        let queue = WorkQueue::new();
        let workers = spawn_workers(h.reconciler.clone(), queue.clone(), Vec::new(), 2);
        for key in &keys {
            queue.add(key.clone());
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = keys
                    .iter()
                    .all(|k| h.store.status(k).phase == ReconcilePhase::Succeeded);
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        queue.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        let max_active = h.store.max_active.load(Ordering::SeqCst);
        assert!(max_active <= 2, "{max_active} reconciles ran at once");
        assert_eq!(h.cluster.len(), 12);
    }

    #[tokio::test]
    async fn test_worker_forgets_modules_found_gone() {
        let h = harness();
        let module = create_test_module("web", json!({"replicas": 1}));
        let key = ModuleKey::from_module(&module);
        let filter = Arc::new(Mutex::new(EventFilter::new()));
        // Seen once, then deleted while the watch was relisting
        filter.lock().unwrap().on_event(watcher::Event::InitApply(module));

        let queue = WorkQueue::new();
        let workers = spawn_workers(h.reconciler.clone(), queue.clone(), vec![filter.clone()], 1);
        queue.add(key);

        tokio::time::timeout(Duration::from_secs(10), async {
            while !filter.lock().unwrap().known_keys().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        queue.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
