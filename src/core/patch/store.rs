use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use super::error::{PatchError, PatchResult};
use super::types::{
    BranchRef, FileMap, PatchProposal, PatchStatus, ProposalId, StatusChange, ValidationReport,
    sha256_hex,
};
use crate::core::atomic::{write_atomic, write_json_atomic};
use crate::core::sandbox::{PathLayout, display_path, safe_relative_path};

const PROPOSAL_FILE: &str = "proposal.json";
const VALIDATION_FILE: &str = "validation.json";
const LOCK_FILE: &str = ".lock";

/// Durable proposal persistence keyed by id.
///
/// `update` is the only way to mutate an existing record: it runs the closure
/// against the latest stored state while holding that proposal's lock, so a
/// status check inside the closure behaves as compare-and-swap. Unrelated ids
/// never contend.
pub trait PatchStore: Send + Sync {
    fn get(&self, id: &ProposalId) -> PatchResult<PatchProposal>;

    /// Insert a new proposal or overwrite metadata of an existing one.
    /// File contents of an existing proposal cannot change.
    fn put(&self, proposal: &PatchProposal) -> PatchResult<()>;

    /// All readable proposals, in no particular order. Corrupt records are
    /// skipped with a warning.
    fn list(&self) -> PatchResult<Vec<PatchProposal>>;

    fn update(
        &self,
        id: &ProposalId,
        apply: &mut dyn FnMut(&mut PatchProposal) -> PatchResult<()>,
    ) -> PatchResult<PatchProposal>;
}

fn ensure_same_content(current: &PatchProposal, next: &PatchProposal) -> PatchResult<()> {
    if current.content_hash != next.content_hash || current.files != next.files {
        return Err(PatchError::ContentImmutable(current.id.clone()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// One entry of the file list in `proposal.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
    /// Location relative to the proposal directory.
    pub stored_as: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProposalRecord {
    id: ProposalId,
    title: String,
    description: String,
    status: PatchStatus,
    content_hash: String,
    files: Vec<StoredFile>,
    /// `validation.json` belongs to this record only when set, so a reader
    /// never pairs an old status with a half-written report.
    #[serde(default)]
    validated: bool,
    #[serde(default)]
    branch_ref: Option<BranchRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merge_claim: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Vec<StatusChange>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// `<root>/<id>/{proposal.json, validation.json, files/, quarantine/}`.
pub struct FilePatchStore {
    root: PathBuf,
}

impl FilePatchStore {
    pub fn new(root: impl Into<PathBuf>) -> PatchResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn proposal_dir(&self, id: &ProposalId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn lock(&self, id: &ProposalId) -> PatchResult<std::fs::File> {
        let dir = self.proposal_dir(id);
        if !dir.is_dir() {
            return Err(PatchError::NotFound(id.clone()));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    }

    /// Lay out file contents: safe paths under `files/`, anything else
    /// (another spelling of a used path, or a path that would turn a stored
    /// file into a directory or the reverse) under `quarantine/`.
    fn write_files(dir: &Path, files: &FileMap) -> PatchResult<Vec<StoredFile>> {
        let mut layout = PathLayout::default();
        let mut stored = Vec::with_capacity(files.len());
        for (path, content) in files {
            let relative = match safe_relative_path(path) {
                Ok(rel) if layout.claim(&rel).is_ok() => {
                    format!("files/{}", display_path(&rel))
                }
                _ => format!("quarantine/{}", sha256_hex(path.as_bytes())),
            };
            let target = dir.join(&relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, content.as_bytes())?;
            stored.push(StoredFile {
                path: path.clone(),
                sha256: sha256_hex(content.as_bytes()),
                bytes: content.len(),
                stored_as: relative,
            });
        }
        Ok(stored)
    }

    fn record_for(proposal: &PatchProposal, files: Vec<StoredFile>) -> ProposalRecord {
        ProposalRecord {
            id: proposal.id.clone(),
            title: proposal.title.clone(),
            description: proposal.description.clone(),
            status: proposal.status,
            content_hash: proposal.content_hash.clone(),
            files,
            validated: proposal.validation_report.is_some(),
            branch_ref: proposal.branch_ref.clone(),
            merge_claim: proposal.merge_claim,
            history: proposal.history.clone(),
            created_at: proposal.created_at,
            updated_at: proposal.updated_at,
        }
    }

    fn read_record(dir: &Path, id: &str) -> PatchResult<ProposalRecord> {
        let raw = std::fs::read(dir.join(PROPOSAL_FILE)).map_err(|e| PatchError::Corrupt {
            id: id.to_string(),
            reason: format!("{} unreadable: {}", PROPOSAL_FILE, e),
        })?;
        serde_json::from_slice(&raw).map_err(|e| PatchError::Corrupt {
            id: id.to_string(),
            reason: format!("{} unparseable: {}", PROPOSAL_FILE, e),
        })
    }

    fn load_dir(dir: &Path, name: &str) -> PatchResult<PatchProposal> {
        let corrupt = |reason: String| PatchError::Corrupt {
            id: name.to_string(),
            reason,
        };
        let record = Self::read_record(dir, name)?;
        if record.id.as_str() != name {
            return Err(corrupt(format!("record id {} in wrong directory", record.id)));
        }

        let mut files = FileMap::new();
        for entry in &record.files {
            let location = safe_relative_path(&entry.stored_as)
                .map_err(|e| corrupt(format!("bad stored location: {}", e)))?;
            let bytes = std::fs::read(dir.join(location))
                .map_err(|e| corrupt(format!("{} unreadable: {}", entry.stored_as, e)))?;
            if sha256_hex(&bytes) != entry.sha256 {
                return Err(corrupt(format!("{} checksum mismatch", entry.path)));
            }
            let content = String::from_utf8(bytes)
                .map_err(|_| corrupt(format!("{} is not UTF-8", entry.path)))?;
            files.insert(entry.path.clone(), content);
        }
        if files.is_empty() {
            return Err(corrupt("record lists no files".to_string()));
        }
        if super::types::content_hash(&files) != record.content_hash {
            return Err(corrupt("content hash mismatch".to_string()));
        }

        let validation_report = if record.validated {
            let raw = std::fs::read(dir.join(VALIDATION_FILE))
                .map_err(|e| corrupt(format!("{} unreadable: {}", VALIDATION_FILE, e)))?;
            let report: ValidationReport = serde_json::from_slice(&raw)
                .map_err(|e| corrupt(format!("{} unparseable: {}", VALIDATION_FILE, e)))?;
            if report.content_hash != record.content_hash {
                return Err(corrupt("validation report is for different content".to_string()));
            }
            Some(report)
        } else {
            None
        };
        if record.status != PatchStatus::Draft && validation_report.is_none() {
            return Err(corrupt(format!("{} without a validation report", record.status)));
        }

        Ok(PatchProposal {
            id: record.id,
            title: record.title,
            description: record.description,
            files,
            content_hash: record.content_hash,
            status: record.status,
            validation_report,
            branch_ref: record.branch_ref,
            merge_claim: record.merge_claim,
            history: record.history,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn load(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        let dir = self.proposal_dir(id);
        if !dir.is_dir() {
            return Err(PatchError::NotFound(id.clone()));
        }
        Self::load_dir(&dir, id.as_str())
    }

    /// Rewrite metadata of an existing proposal. The report goes first and
    /// `proposal.json` last, each replaced atomically.
    fn persist_existing(&self, current: &PatchProposal, next: &PatchProposal) -> PatchResult<()> {
        let dir = self.proposal_dir(&next.id);
        if let Some(report) = &next.validation_report
            && current.validation_report.as_ref() != Some(report)
        {
            write_json_atomic(&dir.join(VALIDATION_FILE), report)?;
        }
        let previous = Self::read_record(&dir, next.id.as_str())?;
        let record = Self::record_for(next, previous.files);
        write_json_atomic(&dir.join(PROPOSAL_FILE), &record)?;
        Ok(())
    }

    fn insert_new(&self, proposal: &PatchProposal) -> PatchResult<()> {
        let staging = self
            .root
            .join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
        let result = (|| -> PatchResult<()> {
            std::fs::create_dir_all(&staging)?;
            let stored = Self::write_files(&staging, &proposal.files)?;
            if let Some(report) = &proposal.validation_report {
                write_json_atomic(&staging.join(VALIDATION_FILE), report)?;
            }
            let record = Self::record_for(proposal, stored);
            let bytes = serde_json::to_vec_pretty(&record)?;
            write_atomic(&staging.join(PROPOSAL_FILE), &bytes)?;
            std::fs::rename(&staging, self.proposal_dir(&proposal.id))?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        result
    }
}

impl PatchStore for FilePatchStore {
    fn get(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        self.load(id)
    }

    fn put(&self, proposal: &PatchProposal) -> PatchResult<()> {
        if proposal.files.is_empty() {
            return Err(PatchError::EmptyBundle);
        }
        if !self.proposal_dir(&proposal.id).is_dir() {
            debug!("Persisting new proposal {}", proposal.id);
            return self.insert_new(proposal);
        }
        let _guard = self.lock(&proposal.id)?;
        let current = self.load(&proposal.id)?;
        ensure_same_content(&current, proposal)?;
        self.persist_existing(&current, proposal)
    }

    fn list(&self) -> PatchResult<Vec<PatchProposal>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if ProposalId::parse(&name).is_none() {
                warn!("Skipping unexpected directory in patch store: {}", name);
                continue;
            }
            match Self::load_dir(&entry.path(), &name) {
                Ok(p) => out.push(p),
                Err(e) => warn!("Skipping unreadable proposal {}: {}", name, e),
            }
        }
        Ok(out)
    }

    fn update(
        &self,
        id: &ProposalId,
        apply: &mut dyn FnMut(&mut PatchProposal) -> PatchResult<()>,
    ) -> PatchResult<PatchProposal> {
        let _guard = self.lock(id)?;
        let current = self.load(id)?;
        let mut next = current.clone();
        apply(&mut next)?;
        ensure_same_content(&current, &next)?;
        self.persist_existing(&current, &next)?;
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Same contract as [`FilePatchStore`], for unit tests and dry runs.
#[derive(Default)]
pub struct MemoryPatchStore {
    proposals: RwLock<HashMap<ProposalId, Arc<Mutex<PatchProposal>>>>,
}

impl MemoryPatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &ProposalId) -> PatchResult<Arc<Mutex<PatchProposal>>> {
        let map = self.proposals.read().unwrap_or_else(|e| e.into_inner());
        map.get(id)
            .cloned()
            .ok_or_else(|| PatchError::NotFound(id.clone()))
    }
}

impl PatchStore for MemoryPatchStore {
    fn get(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        let slot = self.slot(id)?;
        let proposal = slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(proposal.clone())
    }

    fn put(&self, proposal: &PatchProposal) -> PatchResult<()> {
        if proposal.files.is_empty() {
            return Err(PatchError::EmptyBundle);
        }
        let mut map = self.proposals.write().unwrap_or_else(|e| e.into_inner());
        match map.get(&proposal.id) {
            Some(slot) => {
                let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
                ensure_same_content(&current, proposal)?;
                *current = proposal.clone();
            }
            None => {
                map.insert(proposal.id.clone(), Arc::new(Mutex::new(proposal.clone())));
            }
        }
        Ok(())
    }

    fn list(&self) -> PatchResult<Vec<PatchProposal>> {
        let map = self.proposals.read().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .values()
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect())
    }

    fn update(
        &self,
        id: &ProposalId,
        apply: &mut dyn FnMut(&mut PatchProposal) -> PatchResult<()>,
    ) -> PatchResult<PatchProposal> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = current.clone();
        apply(&mut next)?;
        ensure_same_content(&current, &next)?;
        *current = next.clone();
        Ok(next)
    }
}
