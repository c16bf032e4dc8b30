//! Operator configuration
//!
//! Every setting can be given as a flag or through its environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

use crate::controller::{ReconcilerConfig, RuntimeConfig};
use crate::error::{Error, Result};
use crate::gitops::{GitWriteClient, DEFAULT_COMMIT_MESSAGE_TEMPLATE};

#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace watched for Modules; `*` watches every namespace
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "moduleops")]
    pub watch_namespace: String,

    /// Additional namespace watched for Modules sourced from Helm repositories
    #[arg(long, env = "WATCH_NAMESPACE_HELM")]
    pub watch_namespace_helm: Option<String>,

    /// Force every rendered namespaced resource into this namespace
    #[arg(long, env = "MODULE_TARGET_NAMESPACE")]
    pub module_target_namespace: Option<String>,

    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    pub max_concurrent_reconciles: usize,

    /// Template for GitOps commit messages
    #[arg(long, env = "COMMIT_MESSAGE_TEMPLATE", default_value = DEFAULT_COMMIT_MESSAGE_TEMPLATE)]
    pub commit_message_template: String,

    /// Never export traces, even when an OTLP endpoint is configured
    #[arg(long, env = "DISABLE_TELEMETRY")]
    pub disable_telemetry: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Seconds between full resyncs of every known Module
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Deadline of a single reconcile attempt in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 120)]
    pub reconcile_timeout_secs: u64,

    /// History entries kept in each Module's status
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 10)]
    pub history_limit: usize,

    /// Maximum number of cached templates; 0 means unbounded
    #[arg(long, env = "TEMPLATE_CACHE_CAPACITY", default_value_t = 0)]
    pub template_cache_capacity: usize,

    /// Only reconcile while holding the leader Lease
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Namespace of the leader Lease and of credential Secrets
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "moduleops")]
    pub operator_namespace: String,

    /// Address the REST API listens on
    #[arg(long, env = "REST_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub rest_bind_address: SocketAddr,

    /// Author recorded on GitOps commits
    #[arg(long, env = "GIT_AUTHOR_NAME", default_value = "moduleops")]
    pub git_author_name: String,

    #[arg(long, env = "GIT_AUTHOR_EMAIL", default_value = "moduleops@localhost")]
    pub git_author_email: String,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::ConfigError(
                "MAX_CONCURRENT_RECONCILES must be at least 1".to_string(),
            ));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "reconcile timeout must be at least one second".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(Error::ConfigError("history limit must be at least 1".to_string()));
        }
        if self.watch_namespace.trim().is_empty() {
            return Err(Error::ConfigError("WATCH_NAMESPACE must not be empty".to_string()));
        }
        GitWriteClient::validate_message_template(&self.commit_message_template)
    }

    /// `None` when Modules are watched cluster-wide
    pub fn watch_namespace(&self) -> Option<String> {
        match self.watch_namespace.as_str() {
            "*" | "all" => None,
            ns => Some(ns.to_string()),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            history_limit: self.history_limit,
            target_namespace_override: self.module_target_namespace.clone(),
            attempt_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            ..Default::default()
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            watch_namespace: self.watch_namespace(),
            helm_watch_namespace: self.watch_namespace_helm.clone(),
        }
    }

    /// Whether OpenTelemetry export should be set up
    pub fn telemetry_enabled(&self) -> bool {
        !self.disable_telemetry && std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
    }
}
