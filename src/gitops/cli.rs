//! [`GitBackend`] over the command-line `git` client
//!
//! Every operation works in a fresh temporary clone: a shallow fetch of the
//! branch tip, then for commits a fast-forward push of a single new commit.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{BranchSnapshot, GitBackend, PushOutcome};
use crate::auth::Credentials;
use crate::crd::GitOpsWriteDestination;
use crate::error::{Error, Result};
use crate::template::source::{child_command, url_with_credentials};

const MISSING_REF_MARKERS: &[&str] = &["couldn't find remote ref", "could not find remote ref"];
const REJECTED_MARKERS: &[&str] = &["[rejected]", "non-fast-forward", "fetch first", "failed to push some refs"];

#[derive(Clone, Debug)]
pub struct CliGitBackend {
    author_name: String,
    author_email: String,
}

impl Default for CliGitBackend {
    fn default() -> Self {
        Self::new("moduleops", "moduleops@localhost")
    }
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CliGitBackend {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    async fn run(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput> {
        let output = child_command("git")
            .arg("-C")
            .arg(workdir)
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| Error::GitError(format!("failed to run git: {e}")))?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_ok(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        let out = self.run(workdir, args).await?;
        if !out.success {
            return Err(Error::GitError(format!("git {} failed: {}", args[0], out.stderr)));
        }
        Ok(out.stdout)
    }

    /// Fetch the branch tip into `workdir`; `None` if the branch does not exist
    async fn checkout_tip(&self, workdir: &Path, remote: &str, branch: &str) -> Result<Option<String>> {
        self.run_ok(workdir, &["init", "--quiet"]).await?;
        self.run_ok(workdir, &["remote", "add", "origin", remote]).await?;

        let fetch = self
            .run(workdir, &["fetch", "--quiet", "--depth", "1", "origin", branch])
            .await?;
        if !fetch.success {
            if MISSING_REF_MARKERS.iter().any(|m| fetch.stderr.contains(m)) {
                return Ok(None);
            }
            return Err(Error::GitError(format!("git fetch {branch} failed: {}", fetch.stderr)));
        }
        self.run_ok(workdir, &["checkout", "--quiet", "-B", branch, "FETCH_HEAD"])
            .await?;
        let tip = self.run_ok(workdir, &["rev-parse", "HEAD"]).await?;
        Ok(Some(tip))
    }
}

#[async_trait]
impl GitBackend for CliGitBackend {
    #[instrument(skip(self, credentials), fields(repo = %dest.repo, branch = %dest.branch))]
    async fn snapshot(
        &self,
        dest: &GitOpsWriteDestination,
        file: &str,
        credentials: &Credentials,
    ) -> Result<BranchSnapshot> {
        let workdir = tempfile::tempdir()?;
        let remote = url_with_credentials(&dest.repo, credentials);
        let Some(commit) = self.checkout_tip(workdir.path(), &remote, &dest.branch).await? else {
            return Ok(BranchSnapshot::default());
        };
        let content = match tokio::fs::read(workdir.path().join(file)).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        debug!("Branch tip {} ({} present: {})", commit, file, content.is_some());
        Ok(BranchSnapshot {
            commit: Some(commit),
            content,
        })
    }

    #[instrument(skip(self, credentials, base, content), fields(repo = %dest.repo, branch = %dest.branch))]
    async fn commit(
        &self,
        dest: &GitOpsWriteDestination,
        file: &str,
        credentials: &Credentials,
        base: &BranchSnapshot,
        content: &[u8],
        message: &str,
    ) -> Result<PushOutcome> {
        let workdir = tempfile::tempdir()?;
        let remote = url_with_credentials(&dest.repo, credentials);
        let tip = self.checkout_tip(workdir.path(), &remote, &dest.branch).await?;
        if tip != base.commit {
            return Ok(PushOutcome::Rejected {
                reason: format!("branch tip moved from {:?} to {:?}", base.commit, tip),
            });
        }
        if tip.is_none() {
            let head = format!("refs/heads/{}", dest.branch);
            self.run_ok(workdir.path(), &["symbolic-ref", "HEAD", &head])
                .await?;
        }

        let target = workdir.path().join(file);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        self.run_ok(workdir.path(), &["add", "--", file]).await?;
        self.run_ok(workdir.path(), &["commit", "--quiet", "-m", message])
            .await?;
        let commit = self.run_ok(workdir.path(), &["rev-parse", "HEAD"]).await?;

        let refspec = format!("HEAD:refs/heads/{}", dest.branch);
        let push = self
            .run(workdir.path(), &["push", "--quiet", "origin", &refspec])
            .await?;
        if !push.success {
            if REJECTED_MARKERS.iter().any(|m| push.stderr.contains(m)) {
                return Ok(PushOutcome::Rejected { reason: push.stderr });
            }
            return Err(Error::GitError(format!("git push failed: {}", push.stderr)));
        }
        Ok(PushOutcome::Pushed { commit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let status = std::process::Command::new("git")
            .args(["init", "--quiet", "--bare"])
            .arg(dir.path())
            .status()
            .unwrap();
        assert!(status.success());
        dir
    }

    #[tokio::test]
    async fn test_commit_to_new_branch_then_snapshot() {
        let repo = bare_repo();
        let dest = GitOpsWriteDestination {
            repo: format!("file://{}", repo.path().display()),
            path: "apps".into(),
            branch: "main".into(),
        };
        let backend = CliGitBackend::default();

        let empty = backend
            .snapshot(&dest, "apps/web.yaml", &Credentials::Anonymous)
            .await
            .unwrap();
        assert_eq!(empty, BranchSnapshot::default());

        let outcome = backend
            .commit(&dest, "apps/web.yaml", &Credentials::Anonymous, &empty, b"kind: X\n", "add web")
            .await
            .unwrap();
        let commit = match outcome {
            PushOutcome::Pushed { commit } => commit,
            other => panic!("expected push, got {other:?}"),
        };

        let snapshot = backend
            .snapshot(&dest, "apps/web.yaml", &Credentials::Anonymous)
            .await
            .unwrap();
        assert_eq!(snapshot.commit, Some(commit));
        assert_eq!(snapshot.content.as_deref(), Some(&b"kind: X\n"[..]));
    }

    #[tokio::test]
    async fn test_stale_base_is_rejected() {
        let repo = bare_repo();
        let dest = GitOpsWriteDestination {
            repo: format!("file://{}", repo.path().display()),
            path: "web.yaml".into(),
            branch: "main".into(),
        };
        let backend = CliGitBackend::default();
        let empty = BranchSnapshot::default();

        backend
            .commit(&dest, "web.yaml", &Credentials::Anonymous, &empty, b"a", "first")
            .await
            .unwrap();
        let outcome = backend
            .commit(&dest, "web.yaml", &Credentials::Anonymous, &empty, b"b", "second")
            .await
            .unwrap();

        assert!(matches!(outcome, PushOutcome::Rejected { .. }));
    }
}
