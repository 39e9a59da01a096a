use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::can_transition;
use super::error::{PatchError, PatchResult};

/// Relative path -> full file content. Proposals are whole-file snapshots.
pub type FileMap = BTreeMap<String, String>;

/// Time-derived, sortable proposal identifier, e.g. `20261018_140312_551204_3f9a1c`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    pub fn generate() -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}_{}", now.format("%Y%m%d_%H%M%S_%6f"), &suffix[..6]))
    }

    /// Accept an identifier typed by a user or read from disk. Only the
    /// characters `generate` produces are allowed so an id is always a
    /// safe single directory name.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        valid.then(|| Self(raw.to_string()))
    }

    #[cfg(test)]
    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchStatus {
    Draft,
    Validated,
    Failed,
    Proposed,
    Approved,
    Rejected,
    Merged,
}

impl PatchStatus {
    pub const ALL: [PatchStatus; 7] = [
        PatchStatus::Draft,
        PatchStatus::Validated,
        PatchStatus::Failed,
        PatchStatus::Proposed,
        PatchStatus::Approved,
        PatchStatus::Rejected,
        PatchStatus::Merged,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatchStatus::Draft => "DRAFT",
            PatchStatus::Validated => "VALIDATED",
            PatchStatus::Failed => "FAILED",
            PatchStatus::Proposed => "PROPOSED",
            PatchStatus::Approved => "APPROVED",
            PatchStatus::Rejected => "REJECTED",
            PatchStatus::Merged => "MERGED",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Some(PatchStatus::Draft),
            "VALIDATED" => Some(PatchStatus::Validated),
            "FAILED" => Some(PatchStatus::Failed),
            "PROPOSED" => Some(PatchStatus::Proposed),
            "APPROVED" => Some(PatchStatus::Approved),
            "REJECTED" => Some(PatchStatus::Rejected),
            "MERGED" => Some(PatchStatus::Merged),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PatchStatus::Merged | PatchStatus::Rejected)
    }

    pub fn glyph(self) -> &'static str {
        match self {
            PatchStatus::Draft => "📝",
            PatchStatus::Validated => "🔎",
            PatchStatus::Failed => "❌",
            PatchStatus::Proposed => "⏳",
            PatchStatus::Approved => "🆗",
            PatchStatus::Rejected => "🚫",
            PatchStatus::Merged => "✅",
        }
    }
}

impl std::fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Bundle,
    PathSafety,
    Syntax,
    Dependencies,
    Lint,
    Tests,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Bundle => "bundle",
            CheckKind::PathSafety => "path",
            CheckKind::Syntax => "syntax",
            CheckKind::Dependencies => "dependencies",
            CheckKind::Lint => "lint",
            CheckKind::Tests => "tests",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub kind: CheckKind,
    pub file: Option<String>,
    pub passed: bool,
    /// Advisory checks are recorded but do not affect `overall_passed`.
    pub mandatory: bool,
    /// No checker ran (no tool for this file type, or an earlier check failed).
    #[serde(default)]
    pub skipped: bool,
    pub message: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn new(kind: CheckKind, file: Option<&str>, passed: bool, message: impl Into<String>) -> Self {
        let check_name = match file {
            Some(f) => format!("{}:{}", kind.as_str(), f),
            None => kind.as_str().to_string(),
        };
        Self {
            check_name,
            kind,
            file: file.map(str::to_string),
            passed,
            mandatory: true,
            skipped: false,
            message: message.into(),
            duration_ms: 0,
        }
    }

    pub fn advisory(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skipped = true;
        self
    }

    pub fn took(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Hash of the exact file set the checks ran against.
    pub content_hash: String,
    pub checks: Vec<CheckResult>,
    pub overall_passed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the sandbox directory was kept for inspection.
    #[serde(default)]
    pub sandbox_dir: Option<PathBuf>,
}

impl ValidationReport {
    pub fn from_checks(
        content_hash: String,
        checks: Vec<CheckResult>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let overall_passed = !checks.is_empty()
            && checks.iter().filter(|c| c.mandatory).all(|c| c.passed);
        Self {
            content_hash,
            checks,
            overall_passed,
            started_at,
            finished_at: Utc::now(),
            sandbox_dir: None,
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Where a proposal's files were materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchRef {
    Git {
        branch: String,
        #[serde(default)]
        patch_file: Option<PathBuf>,
    },
    Directory {
        path: PathBuf,
    },
}

impl std::fmt::Display for BranchRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchRef::Git { branch, .. } => write!(f, "git:{}", branch),
            BranchRef::Directory { path } => write!(f, "dir:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: PatchStatus,
    pub to: PatchStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchProposal {
    pub id: ProposalId,
    pub title: String,
    pub description: String,
    pub files: FileMap,
    pub content_hash: String,
    pub status: PatchStatus,
    pub validation_report: Option<ValidationReport>,
    pub branch_ref: Option<BranchRef>,
    /// Set while a merge is applying files; cleared when it ends.
    pub merge_claim: Option<DateTime<Utc>>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PatchProposal {
    pub fn new(title: &str, description: &str, files: FileMap) -> PatchResult<Self> {
        if files.is_empty() {
            return Err(PatchError::EmptyBundle);
        }
        let now = Utc::now();
        Ok(Self {
            id: ProposalId::generate(),
            title: title.to_string(),
            description: description.to_string(),
            content_hash: content_hash(&files),
            files,
            status: PatchStatus::Draft,
            validation_report: None,
            branch_ref: None,
            merge_claim: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn validation_passed(&self) -> bool {
        self.validation_report
            .as_ref()
            .is_some_and(|r| r.overall_passed)
    }

    /// Attach the sandbox report. Only a DRAFT may receive one, and only for
    /// its own content.
    pub fn attach_report(&mut self, report: ValidationReport) -> PatchResult<()> {
        if self.validation_report.is_some() || self.status != PatchStatus::Draft {
            let to = if report.overall_passed {
                PatchStatus::Validated
            } else {
                PatchStatus::Failed
            };
            return Err(PatchError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        if report.content_hash != self.content_hash {
            return Err(PatchError::Corrupt {
                id: self.id.to_string(),
                reason: "validation report hash does not match proposal content".to_string(),
            });
        }
        self.validation_report = Some(report);
        Ok(())
    }

    /// Move along one edge of the state machine, or fail leaving `self` untouched.
    pub fn transition(&mut self, to: PatchStatus) -> PatchResult<()> {
        let invalid = || PatchError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        };
        if !can_transition(self.status, to) {
            return Err(invalid());
        }
        if to != PatchStatus::Draft && self.validation_report.is_none() {
            return Err(invalid());
        }
        let now = Utc::now();
        self.history.push(StatusChange {
            from: self.status,
            to,
            at: now,
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// SHA-256 over the sorted `(path, content)` pairs.
pub fn content_hash(files: &FileMap) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
