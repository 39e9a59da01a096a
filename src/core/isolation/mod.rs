use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::core::config::GovernanceConfig;
use crate::core::patch::{BranchRef, PatchError, PatchProposal, PatchResult, ProposalId};
use crate::core::process::{CommandOutcome, run_to_file, run_with_timeout};
use crate::core::sandbox::{confined_target, safe_relative_path};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Records a proposal's files somewhere reviewable without touching the
/// caller's working tree: a commit on its own branch when a repository is
/// available, otherwise a directory under the output root.
pub struct Isolator {
    repo: Option<PathBuf>,
    output_root: PathBuf,
    branch_prefix: String,
    commit_message: String,
}

/// Top level of the git repository containing `start`, if any.
pub async fn detect_repository(start: &Path) -> Option<PathBuf> {
    let mut cmd = Command::new("git");
    cmd.args(["rev-parse", "--show-toplevel"]).current_dir(start);
    let outcome = run_with_timeout(cmd, "git rev-parse", Duration::from_secs(10)).await;
    if !outcome.success {
        return None;
    }
    let top = outcome.stdout.trim();
    (!top.is_empty()).then(|| PathBuf::from(top))
}

impl Isolator {
    pub fn new(repo: Option<PathBuf>, output_root: impl Into<PathBuf>, governance: &GovernanceConfig) -> Self {
        Self {
            repo,
            output_root: output_root.into(),
            branch_prefix: governance.branch_prefix.trim_end_matches('/').to_string(),
            commit_message: governance.commit_message.clone(),
        }
    }

    pub fn branch_name(&self, id: &ProposalId) -> String {
        format!("{}/{}", self.branch_prefix, id)
    }

    pub fn patch_file(&self, id: &ProposalId) -> PathBuf {
        self.output_root.join(format!("{}.patch", id))
    }

    /// Exclusive per-id lock, held while a proposal is materialized.
    async fn lock(&self, id: &ProposalId) -> PatchResult<std::fs::File> {
        let dir = self.output_root.join(".locks");
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(format!("{}.lock", id)))?;
        let file = tokio::task::spawn_blocking(move || FileExt::lock_exclusive(&file).map(|_| file))
            .await
            .map_err(|e| PatchError::VersionControl(format!("lock task failed: {}", e)))??;
        Ok(file)
    }

    /// Idempotent per id: an existing branch or directory is returned as is.
    /// Concurrent calls for one id run one after the other.
    pub async fn materialize(&self, proposal: &PatchProposal) -> PatchResult<BranchRef> {
        for path in proposal.files.keys() {
            safe_relative_path(path).map_err(|_| PatchError::UnsafePath(path.clone()))?;
        }
        std::fs::create_dir_all(&self.output_root)?;
        let _guard = self.lock(&proposal.id).await?;
        match &self.repo {
            Some(repo) => self.materialize_branch(repo, proposal).await,
            None => self.materialize_directory(proposal),
        }
    }

    fn materialize_directory(&self, proposal: &PatchProposal) -> PatchResult<BranchRef> {
        let target = self.output_root.join(proposal.id.as_str());
        if target.is_dir() {
            return Ok(BranchRef::Directory { path: target });
        }
        let staging = self
            .output_root
            .join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
        let result = write_files(&staging, proposal).and_then(|_| {
            std::fs::rename(&staging, &target)?;
            Ok(())
        });
        if let Err(e) = result {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        info!("Materialized {} into {}", proposal.id, target.display());
        Ok(BranchRef::Directory { path: target })
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> CommandOutcome {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(cwd);
        let label = format!("git {}", args.first().copied().unwrap_or_default());
        run_with_timeout(cmd, &label, GIT_TIMEOUT).await
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        self.git(repo, &["rev-parse", "--verify", "--quiet", &reference])
            .await
            .success
    }

    fn existing_ref(&self, id: &ProposalId, branch: String) -> BranchRef {
        let patch = self.patch_file(id);
        BranchRef::Git {
            branch,
            patch_file: patch.exists().then_some(patch),
        }
    }

    async fn materialize_branch(&self, repo: &Path, proposal: &PatchProposal) -> PatchResult<BranchRef> {
        let branch = self.branch_name(&proposal.id);
        if self.branch_exists(repo, &branch).await {
            return Ok(self.existing_ref(&proposal.id, branch));
        }

        let worktree = self.output_root.join(".worktrees").join(proposal.id.as_str());
        let worktree_arg = worktree.to_string_lossy().to_string();
        if worktree.exists() {
            self.git(repo, &["worktree", "remove", "--force", &worktree_arg]).await;
            let _ = std::fs::remove_dir_all(&worktree);
            self.git(repo, &["worktree", "prune"]).await;
        }

        let added = self
            .git(repo, &["worktree", "add", "-b", &branch, &worktree_arg, "HEAD"])
            .await;
        if !added.success {
            if self.branch_exists(repo, &branch).await {
                return Ok(self.existing_ref(&proposal.id, branch));
            }
            return Err(PatchError::VersionControl(added.summary()));
        }

        let committed = self.commit_into(&worktree, proposal).await;
        let removed = self
            .git(repo, &["worktree", "remove", "--force", &worktree_arg])
            .await;
        if !removed.success {
            warn!("Could not remove worktree {}: {}", worktree.display(), removed.summary());
        }
        if let Err(e) = committed {
            self.git(repo, &["branch", "-D", &branch]).await;
            return Err(e);
        }

        let patch_file = self.export_patch(repo, &proposal.id, &branch).await;
        info!("Materialized {} on branch {}", proposal.id, branch);
        Ok(BranchRef::Git { branch, patch_file })
    }

    async fn commit_into(&self, worktree: &Path, proposal: &PatchProposal) -> PatchResult<()> {
        write_files(worktree, proposal)?;
        let staged = self.git(worktree, &["add", "-A"]).await;
        if !staged.success {
            return Err(PatchError::VersionControl(staged.summary()));
        }
        let message = format!(
            "{}\n\n{}\n\nProposal: {}",
            self.commit_message, proposal.title, proposal.id
        );
        let committed = self
            .git(
                worktree,
                &[
                    "-c",
                    "user.name=autopatch",
                    "-c",
                    "user.email=autopatch@localhost",
                    "commit",
                    "--no-verify",
                    "--allow-empty",
                    "-m",
                    &message,
                ],
            )
            .await;
        if !committed.success {
            return Err(PatchError::VersionControl(committed.summary()));
        }
        Ok(())
    }

    /// Best effort; a missing patch file does not undo the branch.
    async fn export_patch(&self, repo: &Path, id: &ProposalId, branch: &str) -> Option<PathBuf> {
        let out = self.patch_file(id);
        let mut cmd = Command::new("git");
        cmd.args(["format-patch", "-1", "--stdout", branch]).current_dir(repo);
        let outcome = run_to_file(cmd, "git format-patch", &out, GIT_TIMEOUT).await;
        if outcome.success {
            Some(out)
        } else {
            warn!("Could not export patch for {}: {}", id, outcome.summary());
            let _ = std::fs::remove_file(&out);
            None
        }
    }
}

/// Write the bundle below `root`. Symlinks already under `root` (a checked
/// out worktree may have them) are never followed.
fn write_files(root: &Path, proposal: &PatchProposal) -> PatchResult<()> {
    for (path, content) in &proposal.files {
        let relative = safe_relative_path(path).map_err(|_| PatchError::UnsafePath(path.clone()))?;
        let target = confined_target(root, &relative).map_err(|reason| {
            warn!("Refusing to materialize {}: {}", path, reason);
            PatchError::UnsafePath(path.clone())
        })?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content.as_bytes())?;
    }
    Ok(())
}
