use crate::AttractorError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Shells out to the system `git` binary for commit/branch/worktree/merge
/// orchestration. Worktree management is central to ParallelDispatcher's
/// branch isolation and no available Rust git library exposes it safely, so
/// the CLI is the idiomatic choice here rather than a libgit2 binding.
///
/// All ref/worktree mutations against a given repository are serialized
/// through a single mutex: git's index and ref database are not safe for
/// concurrent writers, and ParallelDispatcher sets up many worktrees
/// back-to-back from concurrent tasks.
#[derive(Clone)]
pub struct GitCheckpointer {
    repo_root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl GitCheckpointer {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Validates the precondition every run checks once at startup: the
    /// repository exists and the worktree is clean.
    pub async fn assert_clean_repo(&self) -> Result<(), AttractorError> {
        let _guard = self.lock.lock().await;
        let output = self.run(&["status", "--porcelain"]).await?;
        if !output.trim().is_empty() {
            return Err(AttractorError::GitCheckpoint(
                "repository has uncommitted changes".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn commit_allow_empty(&self, message: &str) -> Result<String, AttractorError> {
        let _guard = self.lock.lock().await;
        self.run(&["commit", "--allow-empty", "-m", message]).await?;
        self.current_head_locked().await
    }

    pub async fn force_branch(&self, branch: &str, at: &str) -> Result<(), AttractorError> {
        validate_ref_name(branch)?;
        let _guard = self.lock.lock().await;
        self.run(&["branch", "-f", branch, at]).await?;
        Ok(())
    }

    pub async fn worktree_add(
        &self,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), AttractorError> {
        validate_ref_name(branch)?;
        let _guard = self.lock.lock().await;
        self.run(&[
            "worktree",
            "add",
            worktree_path
                .to_str()
                .ok_or_else(|| AttractorError::GitCheckpoint("non-utf8 worktree path".into()))?,
            branch,
        ])
        .await?;
        Ok(())
    }

    pub async fn worktree_remove(&self, worktree_path: &Path) -> Result<(), AttractorError> {
        let _guard = self.lock.lock().await;
        self.run(&[
            "worktree",
            "remove",
            "--force",
            worktree_path
                .to_str()
                .ok_or_else(|| AttractorError::GitCheckpoint("non-utf8 worktree path".into()))?,
        ])
        .await?;
        Ok(())
    }

    pub async fn reset_hard(&self, worktree_path: &Path, to: &str) -> Result<(), AttractorError> {
        let _guard = self.lock.lock().await;
        self.run_in(worktree_path, &["reset", "--hard", to]).await?;
        Ok(())
    }

    /// Fast-forward-only merge; fails rather than creating a merge commit,
    /// matching the engine's refusal to fabricate history on fan-in.
    pub async fn merge_ff_only(
        &self,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), AttractorError> {
        let _guard = self.lock.lock().await;
        self.run_in(worktree_path, &["merge", "--ff-only", branch])
            .await?;
        Ok(())
    }

    /// Best-effort: failures are logged, never surfaced to the caller, so a
    /// missing or unreachable remote never fails a run.
    pub async fn push_best_effort(&self, branch: &str) {
        let _guard = self.lock.lock().await;
        if let Err(error) = self.run(&["push", "origin", branch]).await {
            tracing::warn!(branch, %error, "best-effort git push failed");
        }
    }

    pub async fn current_head(&self) -> Result<String, AttractorError> {
        let _guard = self.lock.lock().await;
        self.current_head_locked().await
    }

    async fn current_head_locked(&self) -> Result<String, AttractorError> {
        Ok(self.run(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String, AttractorError> {
        self.run_in(&self.repo_root, args).await
    }

    async fn run_in(&self, cwd: &Path, args: &[&str]) -> Result<String, AttractorError> {
        tracing::debug!(?args, dir = %cwd.display(), "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|error| {
                AttractorError::GitCheckpoint(format!("failed to spawn git {args:?}: {error}"))
            })?;
        if !output.status.success() {
            return Err(AttractorError::GitCheckpoint(format!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// A conservative subset of git's ref grammar: no leading dash, no `..`, no
/// whitespace or control characters, no trailing `.lock`.
pub fn validate_ref_name(name: &str) -> Result<(), AttractorError> {
    if name.is_empty() || name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return Err(AttractorError::GitCheckpoint(format!(
            "invalid ref name: '{name}'"
        )));
    }
    if name.contains("..") || name.ends_with(".lock") || name.contains("//") {
        return Err(AttractorError::GitCheckpoint(format!(
            "invalid ref name: '{name}'"
        )));
    }
    if name
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control() || "~^:?*[\\".contains(ch))
    {
        return Err(AttractorError::GitCheckpoint(format!(
            "invalid ref name: '{name}'"
        )));
    }
    Ok(())
}

/// Builds the sibling ref-namespace branch name ParallelDispatcher uses for
/// a branch, never nested under the run's own branch.
pub fn parallel_branch_name(
    run_branch_prefix: &str,
    run_id: &str,
    parallel_node_id: &str,
    branch_key: &str,
) -> String {
    format!("{run_branch_prefix}/parallel/{run_id}/{parallel_node_id}/{branch_key}")
}
