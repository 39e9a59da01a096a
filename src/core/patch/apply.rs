use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::error::{PatchError, PatchResult};
use super::types::{PatchProposal, ProposalId};
use crate::core::atomic::append_json_line;
use crate::core::config::ApplyConfig;
use crate::core::process::{CommandOutcome, run_with_timeout};
use crate::core::sandbox::{confined_target, display_path, safe_relative_path};
use crate::platform::{NativePlatform, Platform};

/// One line of `apply_history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRecord {
    pub id: ProposalId,
    pub applied: bool,
    pub files: Vec<String>,
    /// Bundle path -> backup of the file it replaced.
    #[serde(default)]
    pub backups: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub postcheck: Vec<CommandOutcome>,
    #[serde(default)]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Writes approved proposals into the project tree, with backups and
/// rollback when a post-apply check fails.
pub struct Applier {
    project_root: PathBuf,
    backup_dir: PathBuf,
    history_file: PathBuf,
    config: ApplyConfig,
}

impl Applier {
    pub fn new(
        project_root: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        history_file: impl Into<PathBuf>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            backup_dir: backup_dir.into(),
            history_file: history_file.into(),
            config,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Longest one apply can take: every post-check at its timeout, plus
    /// slack for file writes. A merge claim older than this was abandoned.
    pub fn merge_window(&self) -> Duration {
        let checks = self.config.postcheck_commands.len() as u32;
        self.config
            .postcheck_timeout()
            .saturating_mul(checks)
            .saturating_add(Duration::from_secs(60))
    }

    /// Whether `apply_history.jsonl` shows `id` applied at or after `since`.
    pub fn applied_since(&self, id: &ProposalId, since: DateTime<Utc>) -> bool {
        let Ok(history) = std::fs::read_to_string(&self.history_file) else {
            return false;
        };
        history
            .lines()
            .filter_map(|line| serde_json::from_str::<ApplyRecord>(line).ok())
            .any(|r| &r.id == id && r.applied && r.at >= since)
    }

    fn is_allowed(&self, normalized: &str) -> bool {
        if self
            .config
            .deny_dirs
            .iter()
            .any(|deny| normalized == deny.trim_end_matches('/') || normalized.starts_with(deny.as_str()))
        {
            return false;
        }
        self.config.allowed_paths.iter().any(|allow| {
            allow.is_empty()
                || normalized == allow.trim_end_matches('/')
                || normalized.starts_with(allow.as_str())
        })
    }

    /// Resolve every bundle path under the project root, or say why not.
    fn plan(&self, proposal: &PatchProposal) -> PatchResult<Vec<(String, PathBuf)>> {
        if proposal.files.len() > self.config.max_files {
            return Err(PatchError::ApplyRejected(format!(
                "{} files exceeds the limit of {}",
                proposal.files.len(),
                self.config.max_files
            )));
        }
        let mut targets = Vec::with_capacity(proposal.files.len());
        for path in proposal.files.keys() {
            let relative =
                safe_relative_path(path).map_err(|_| PatchError::UnsafePath(path.clone()))?;
            if !self.is_allowed(&display_path(&relative)) {
                return Err(PatchError::ApplyRejected(format!("path not allowed: {}", path)));
            }
            let target = confined_target(&self.project_root, &relative).map_err(|reason| {
                warn!("Refusing to apply {}: {}", path, reason);
                PatchError::UnsafePath(path.clone())
            })?;
            targets.push((path.clone(), target));
        }
        Ok(targets)
    }

    fn backup_path(&self, path: &str, id: &ProposalId) -> PathBuf {
        let flat: String = path
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.backup_dir.join(format!("{}.{}.bak", flat, id))
    }

    fn rollback(backups: &BTreeMap<String, PathBuf>, created: &[PathBuf], targets: &[(String, PathBuf)]) {
        for (path, target) in targets {
            if let Some(backup) = backups.get(path)
                && let Err(e) = std::fs::copy(backup, target)
            {
                warn!("Rollback of {} failed: {}", path, e);
            }
        }
        for target in created {
            if let Err(e) = std::fs::remove_file(target) {
                warn!("Could not remove {} during rollback: {}", target.display(), e);
            }
        }
    }

    async fn postcheck(&self) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::new();
        for command in &self.config.postcheck_commands {
            let mut cmd = NativePlatform::shell_inline(command);
            cmd.current_dir(&self.project_root);
            let outcome = run_with_timeout(cmd, command, self.config.postcheck_timeout()).await;
            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed {
                break;
            }
        }
        outcomes
    }

    fn record(&self, record: &ApplyRecord) {
        if let Err(e) = append_json_line(&self.history_file, record) {
            warn!("Could not append apply history: {}", e);
        }
    }

    pub async fn apply(&self, proposal: &PatchProposal) -> PatchResult<ApplyRecord> {
        let targets = self.plan(proposal)?;
        let mut record = ApplyRecord {
            id: proposal.id.clone(),
            applied: false,
            files: proposal.files.keys().cloned().collect(),
            backups: BTreeMap::new(),
            postcheck: Vec::new(),
            reason: None,
            at: Utc::now(),
        };

        let mut created = Vec::new();
        let written = (|| -> std::io::Result<()> {
            for (path, target) in &targets {
                if target.is_file() {
                    let backup = self.backup_path(path, &proposal.id);
                    std::fs::create_dir_all(&self.backup_dir)?;
                    std::fs::copy(target, &backup)?;
                    record.backups.insert(path.clone(), backup);
                } else {
                    created.push(target.clone());
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, proposal.files[path].as_bytes())?;
            }
            Ok(())
        })();

        let failure = match written {
            Err(e) => Some(format!("write failed: {}", e)),
            Ok(()) => {
                record.postcheck = self.postcheck().await;
                record
                    .postcheck
                    .iter()
                    .find(|o| !o.success)
                    .map(|o| format!("post-apply check failed: {}", o.summary()))
            }
        };

        if let Some(reason) = failure {
            Self::rollback(&record.backups, &created, &targets);
            warn!("Rolled back {}: {}", proposal.id, reason);
            record.reason = Some(reason.clone());
            self.record(&record);
            return Err(PatchError::ApplyRejected(reason));
        }

        record.applied = true;
        self.record(&record);
        info!(
            "Applied {} ({} files, {} backups) to {}",
            proposal.id,
            record.files.len(),
            record.backups.len(),
            self.project_root.display()
        );
        Ok(record)
    }
}
