//! Credentials resolution for template sources and GitOps repositories
//!
//! Credentials are looked up from [`TemplateAuthRule`]s: the rule with the
//! longest `repo` prefix matching the repository URL wins, and its username
//! and password are read from the referenced Secrets. No matching rule means
//! anonymous access. Nothing is cached; every call reads secret storage.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{api::ListParams, Api, Client, ResourceExt};
use tracing::debug;

use crate::crd::{SecretKeyRef, TemplateAuthRule, TemplateAuthRuleSpec, TemplateRef};
use crate::error::{Error, Result};

#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Read access to secret material
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Data of the named Secret, or `None` if it does not exist
    async fn get_secret(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    async fn list_auth_rules(&self) -> Result<Vec<TemplateAuthRuleSpec>>;
}

/// Secrets and auth rules from a single namespace of the cluster
#[derive(Clone)]
pub struct KubeSecretStore {
    secrets: Api<Secret>,
    rules: Api<TemplateAuthRule>,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client.clone(), namespace),
            rules: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secret = self.secrets.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn list_auth_rules(&self) -> Result<Vec<TemplateAuthRuleSpec>> {
        let rules = self.rules.list(&ListParams::default()).await?;
        Ok(rules
            .items
            .into_iter()
            .map(|r| {
                debug!("Loaded auth rule {}", r.name_any());
                r.spec
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct CredentialsResolver {
    store: Arc<dyn SecretStore>,
}

impl CredentialsResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, reference: &TemplateRef) -> Result<Credentials> {
        self.resolve_repo(&reference.source_url).await
    }

    /// Credentials for a repository URL
    pub async fn resolve_repo(&self, repo_url: &str) -> Result<Credentials> {
        let rules = self.store.list_auth_rules().await?;
        let Some(rule) = best_rule(&rules, repo_url) else {
            return Ok(Credentials::Anonymous);
        };
        debug!("Using auth rule {} for {}", rule.repo, repo_url);

        let username = self.read_key(&rule.username, repo_url).await?;
        let password = self.read_key(&rule.password, repo_url).await?;
        Ok(Credentials::Basic { username, password })
    }

    async fn read_key(&self, key_ref: &SecretKeyRef, repo_url: &str) -> Result<String> {
        let data = self
            .store
            .get_secret(&key_ref.name)
            .await?
            .ok_or_else(|| Error::CredentialsNotFound {
                reference: repo_url.to_string(),
                message: format!("secret '{}' not found", key_ref.name),
            })?;
        let raw = data.get(&key_ref.key).ok_or_else(|| Error::CredentialsMalformed {
            reference: repo_url.to_string(),
            message: format!("secret '{}' has no key '{}'", key_ref.name, key_ref.key),
        })?;
        let value = String::from_utf8(raw.clone()).map_err(|_| Error::CredentialsMalformed {
            reference: repo_url.to_string(),
            message: format!("secret '{}' key '{}' is not UTF-8", key_ref.name, key_ref.key),
        })?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(Error::CredentialsMalformed {
                reference: repo_url.to_string(),
                message: format!("secret '{}' key '{}' is empty", key_ref.name, key_ref.key),
            });
        }
        Ok(value)
    }
}

fn normalize_url(url: &str) -> &str {
    let url = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let url = url.trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}

/// `prefix` covers `target` only up to a path boundary, so a rule for
/// `github.com` never matches `github.com.evil.example`
fn covers(prefix: &str, target: &str) -> bool {
    match target.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn best_rule<'a>(rules: &'a [TemplateAuthRuleSpec], repo_url: &str) -> Option<&'a TemplateAuthRuleSpec> {
    let target = normalize_url(repo_url);
    rules
        .iter()
        .filter(|r| {
            let prefix = normalize_url(&r.repo);
            !prefix.is_empty() && covers(prefix, target)
        })
        .max_by_key(|r| normalize_url(&r.repo).len())
}
