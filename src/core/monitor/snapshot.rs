use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::config::DataLayout;

/// Copy `patches/` and `cycles.jsonl` into `backups/snapshot_<unix>`.
/// Dot-prefixed entries (lock files, in-flight staging directories) are left out.
pub fn take_snapshot(layout: &DataLayout) -> Result<PathBuf> {
    let base = layout
        .backups_dir()
        .join(format!("snapshot_{}", chrono::Utc::now().timestamp()));
    let mut target = base.clone();
    let mut n = 1;
    while target.exists() {
        target = PathBuf::from(format!("{}_{}", base.display(), n));
        n += 1;
    }
    std::fs::create_dir_all(&target)
        .with_context(|| format!("Failed to create {}", target.display()))?;

    let patches = layout.patches_dir();
    let mut copied = 0;
    if patches.is_dir() {
        copied += copy_tree(&patches, &target.join("patches"))?;
    }
    let cycles = layout.cycles_file();
    if cycles.is_file() {
        std::fs::copy(&cycles, target.join("cycles.jsonl"))?;
        copied += 1;
    }
    info!("Snapshot {} written ({} files)", target.display(), copied);
    Ok(target)
}

fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&path, &to.join(&name))?;
        } else {
            std::fs::copy(&path, to.join(&name))
                .with_context(|| format!("Failed to copy {}", path.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_records_without_locks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.ensure().unwrap();
        let record = layout.patches_dir().join("20260101_000000_000000_abcdef");
        std::fs::create_dir_all(record.join("files/src")).unwrap();
        std::fs::write(record.join("proposal.json"), "{}").unwrap();
        std::fs::write(record.join("files/src/a.py"), "x = 1\n").unwrap();
        std::fs::write(record.join(".lock"), "").unwrap();
        std::fs::create_dir_all(layout.patches_dir().join(".staging-1")).unwrap();
        std::fs::write(layout.cycles_file(), "{}\n").unwrap();

        let first = take_snapshot(&layout).unwrap();
        let second = take_snapshot(&layout).unwrap();

        assert_ne!(first, second);
        let copy = first.join("patches/20260101_000000_000000_abcdef");
        assert_eq!(std::fs::read_to_string(copy.join("files/src/a.py")).unwrap(), "x = 1\n");
        assert!(first.join("cycles.jsonl").is_file());
        assert!(copy.join("proposal.json").is_file());
        assert!(!copy.join(".lock").exists());
        assert!(!first.join("patches/.staging-1").exists());
    }
}
