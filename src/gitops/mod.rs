//! GitOps write-back
//!
//! Modules with a GitOps destination get their rendered manifest committed
//! to `<repo>/<path>@<branch>` instead of applied. Writes to the same
//! `(repo, branch)` are serialized; unchanged content produces no commit; a
//! push rejected by a concurrent update is retried once on the new tip.

mod cli;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use minijinja::{context, Environment};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::auth::Credentials;
use crate::crd::GitOpsWriteDestination;
use crate::error::{Error, Result};
use crate::template::RenderedManifest;

pub use cli::CliGitBackend;

pub const DEFAULT_COMMIT_MESSAGE_TEMPLATE: &str =
    "Update {{ module.namespace }}/{{ module.name }} to {{ template.version }}";

/// State of the destination file on the branch tip
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchSnapshot {
    /// Tip commit, `None` when the branch does not exist yet
    pub commit: Option<String>,
    /// File content at the tip, `None` when absent
    pub content: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed { commit: String },
    /// The branch moved since the snapshot was taken
    Rejected { reason: String },
}

/// Repository operations used by [`GitWriteClient`]
#[async_trait]
pub trait GitBackend: Send + Sync {
    async fn snapshot(
        &self,
        dest: &GitOpsWriteDestination,
        file: &str,
        credentials: &Credentials,
    ) -> Result<BranchSnapshot>;

    /// Commit `content` to `file` on top of `base` and push it
    async fn commit(
        &self,
        dest: &GitOpsWriteDestination,
        file: &str,
        credentials: &Credentials,
        base: &BranchSnapshot,
        content: &[u8],
        message: &str,
    ) -> Result<PushOutcome>;
}

/// Variables available to the commit message template
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommitContext {
    pub module_name: String,
    pub module_namespace: String,
    pub template_version: String,
    pub template_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitRef {
    pub commit: String,
    /// false when the content was already up to date
    pub created: bool,
}

pub struct GitWriteClient {
    backend: Arc<dyn GitBackend>,
    message_template: String,
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl GitWriteClient {
    pub fn new(backend: Arc<dyn GitBackend>, message_template: impl Into<String>) -> Self {
        Self {
            backend,
            message_template: message_template.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Check the commit message template compiles
    pub fn validate_message_template(template: &str) -> Result<()> {
        Environment::new()
            .template_from_str(template)
            .map(|_| ())
            .map_err(|e| Error::ConfigError(format!("invalid commit message template: {e}")))
    }

    pub fn commit_message(&self, ctx: &CommitContext) -> Result<String> {
        let env = Environment::new();
        let rendered = env
            .render_str(
                &self.message_template,
                context! {
                    module => context! {
                        name => &ctx.module_name,
                        namespace => &ctx.module_namespace,
                    },
                    template => context! {
                        version => &ctx.template_version,
                        url => &ctx.template_url,
                    },
                },
            )
            .map_err(|e| Error::ConfigError(format!("commit message template: {e}")))?;
        Ok(rendered.trim().to_string())
    }

    #[instrument(skip(self, manifest, ctx, credentials), fields(repo = %dest.repo, branch = %dest.branch))]
    pub async fn write(
        &self,
        dest: &GitOpsWriteDestination,
        manifest: &RenderedManifest,
        ctx: &CommitContext,
        credentials: &Credentials,
    ) -> Result<CommitRef> {
        let file = dest.file_path(&ctx.module_name);
        let content = manifest.to_yaml()?.into_bytes();
        let message = self.commit_message(ctx)?;

        let lock = self.branch_lock(dest);
        let _guard = lock.lock().await;

        let mut base = self.backend.snapshot(dest, &file, credentials).await?;
        for attempt in 0..2 {
            if base.content.as_deref() == Some(content.as_slice()) {
                info!("{} is up to date on {}, skipping commit", file, dest.branch);
                return Ok(CommitRef {
                    commit: base.commit.unwrap_or_default(),
                    created: false,
                });
            }

            match self
                .backend
                .commit(dest, &file, credentials, &base, &content, &message)
                .await?
            {
                PushOutcome::Pushed { commit } => {
                    info!("Committed {} to {}@{} as {}", file, dest.repo, dest.branch, commit);
                    return Ok(CommitRef {
                        commit,
                        created: true,
                    });
                }
                PushOutcome::Rejected { reason } => {
                    warn!("Push attempt {} to {} rejected: {}", attempt + 1, dest.branch, reason);
                    if attempt == 0 {
                        base = self.backend.snapshot(dest, &file, credentials).await?;
                    }
                }
            }
        }

        Err(Error::GitPushConflict {
            repo: dest.repo.clone(),
            branch: dest.branch.clone(),
        })
    }

    fn branch_lock(&self, dest: &GitOpsWriteDestination) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((dest.repo.clone(), dest.branch.clone()))
            .or_default()
            .clone()
    }
}
