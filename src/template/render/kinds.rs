//! Resource kind registry
//!
//! Rendering and apply need to know, per kind, whether objects are
//! namespaced, in which order kinds are applied and how a body is normalized
//! before hashing. Kinds register into an explicit [`KindRegistry`]; kinds
//! nobody registered are treated as namespaced and applied last.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;

use super::manifest::content_hash;

/// Priority assigned to kinds without a registration
pub const UNKNOWN_PRIORITY: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

pub trait ResourceKind: Send + Sync {
    fn kind(&self) -> &str;

    fn scope(&self) -> Scope;

    /// Lower priorities are applied first and deleted last
    fn priority(&self) -> u32;

    /// Rewrite the body into the form the API server stores
    fn normalize(&self, _body: &mut Value) -> Result<(), String> {
        Ok(())
    }

    /// Fingerprint used to decide whether a live object needs an update
    fn fingerprint(&self, body: &Value) -> String {
        content_hash(body)
    }
}

#[derive(Clone, Debug)]
struct BuiltinKind {
    kind: &'static str,
    scope: Scope,
    priority: u32,
}

impl ResourceKind for BuiltinKind {
    fn kind(&self) -> &str {
        self.kind
    }

    fn scope(&self) -> Scope {
        self.scope
    }

    fn priority(&self) -> u32 {
        self.priority
    }
}

/// Secrets: `stringData` is folded into base64 `data`, as the API server does
#[derive(Clone, Debug)]
struct SecretKind {
    priority: u32,
}

impl ResourceKind for SecretKind {
    fn kind(&self) -> &str {
        "Secret"
    }

    fn scope(&self) -> Scope {
        Scope::Namespaced
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn normalize(&self, body: &mut Value) -> Result<(), String> {
        let Some(obj) = body.as_object_mut() else {
            return Ok(());
        };
        let Some(string_data) = obj.remove("stringData") else {
            return Ok(());
        };
        let Value::Object(string_data) = string_data else {
            return Err("stringData must be a mapping".to_string());
        };

        let data = obj
            .entry("data")
            .or_insert_with(|| Value::Object(Default::default()));
        if data.is_null() {
            *data = Value::Object(Default::default());
        }
        let Some(data) = data.as_object_mut() else {
            return Err("data must be a mapping".to_string());
        };
        for (key, value) in string_data {
            let raw = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            data.insert(key, Value::String(STANDARD.encode(raw.as_bytes())));
        }
        Ok(())
    }
}

/// Conventional install order; cluster-scoped kinds flagged
const INSTALL_ORDER: &[(&str, Scope)] = &[
    ("Namespace", Scope::Cluster),
    ("NetworkPolicy", Scope::Namespaced),
    ("ResourceQuota", Scope::Namespaced),
    ("LimitRange", Scope::Namespaced),
    ("PodSecurityPolicy", Scope::Cluster),
    ("PodDisruptionBudget", Scope::Namespaced),
    ("ServiceAccount", Scope::Namespaced),
    ("Secret", Scope::Namespaced),
    ("ConfigMap", Scope::Namespaced),
    ("StorageClass", Scope::Cluster),
    ("PersistentVolume", Scope::Cluster),
    ("PersistentVolumeClaim", Scope::Namespaced),
    ("CustomResourceDefinition", Scope::Cluster),
    ("ClusterRole", Scope::Cluster),
    ("ClusterRoleBinding", Scope::Cluster),
    ("Role", Scope::Namespaced),
    ("RoleBinding", Scope::Namespaced),
    ("Service", Scope::Namespaced),
    ("DaemonSet", Scope::Namespaced),
    ("Pod", Scope::Namespaced),
    ("ReplicaSet", Scope::Namespaced),
    ("Deployment", Scope::Namespaced),
    ("HorizontalPodAutoscaler", Scope::Namespaced),
    ("StatefulSet", Scope::Namespaced),
    ("Job", Scope::Namespaced),
    ("CronJob", Scope::Namespaced),
    ("Ingress", Scope::Namespaced),
    ("APIService", Scope::Cluster),
];

/// Cluster-scoped kinds outside the install order, applied after it
const EXTRA_CLUSTER_KINDS: &[&str] = &[
    "PriorityClass",
    "IngressClass",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

#[derive(Clone, Default)]
pub struct KindRegistry {
    kinds: HashMap<String, Arc<dyn ResourceKind>>,
}

impl KindRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (i, &(kind, scope)) in INSTALL_ORDER.iter().enumerate() {
            let priority = (i as u32 + 1) * 10;
            if kind == "Secret" {
                registry.register(Arc::new(SecretKind { priority }));
            } else {
                registry.register(Arc::new(BuiltinKind {
                    kind,
                    scope,
                    priority,
                }));
            }
        }
        let next = (INSTALL_ORDER.len() as u32 + 1) * 10;
        for &kind in EXTRA_CLUSTER_KINDS {
            registry.register(Arc::new(BuiltinKind {
                kind,
                scope: Scope::Cluster,
                priority: next,
            }));
        }
        registry
    }

    /// Register a kind, replacing any previous registration
    pub fn register(&mut self, kind: Arc<dyn ResourceKind>) {
        self.kinds.insert(kind.kind().to_string(), kind);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn ResourceKind> {
        self.kinds.get(kind).map(|k| k.as_ref())
    }

    pub fn scope(&self, kind: &str) -> Scope {
        self.get(kind).map(|k| k.scope()).unwrap_or(Scope::Namespaced)
    }

    pub fn priority(&self, kind: &str) -> u32 {
        self.get(kind).map(|k| k.priority()).unwrap_or(UNKNOWN_PRIORITY)
    }

    pub fn normalize(&self, kind: &str, body: &mut Value) -> Result<(), String> {
        match self.get(kind) {
            Some(k) => k.normalize(body),
            None => Ok(()),
        }
    }

    pub fn fingerprint(&self, kind: &str, body: &Value) -> String {
        match self.get(kind) {
            Some(k) => k.fingerprint(body),
            None => content_hash(body),
        }
    }
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("KindRegistry").field("kinds", &kinds).finish()
    }
}
