use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Normalize a bundle path into a relative path that cannot leave whatever
/// root it is joined onto. `..` is rejected outright, even when it would
/// resolve back inside the root.
pub fn safe_relative_path(raw: &str) -> Result<PathBuf, String> {
    if raw.trim().is_empty() {
        return Err("empty path".to_string());
    }
    if raw.contains('\0') {
        return Err("path contains a NUL byte".to_string());
    }
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(format!("absolute path '{}'", raw));
    }

    let mut out = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(format!("'{}' escapes the root", raw)),
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(format!("'{}' names no file", raw));
    }
    Ok(out)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Paths claimed under one root. A later path may not reuse an earlier file
/// as a directory, nor an earlier directory as a file.
#[derive(Debug, Default)]
pub struct PathLayout {
    files: HashSet<PathBuf>,
    dirs: HashSet<PathBuf>,
}

impl PathLayout {
    /// Claim `relative`, or say which earlier claim it collides with.
    pub fn claim(&mut self, relative: &Path) -> Result<(), String> {
        if self.files.contains(relative) {
            return Err(format!("duplicates {}", display_path(relative)));
        }
        if self.dirs.contains(relative) {
            return Err(format!("{} is also a directory", display_path(relative)));
        }
        let parents: Vec<PathBuf> = relative
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        if let Some(file) = parents.iter().find(|p| self.files.contains(*p)) {
            return Err(format!("{} is also a file", display_path(file)));
        }
        self.files.insert(relative.to_path_buf());
        self.dirs.extend(parents);
        Ok(())
    }
}

/// `root.join(relative)`, refused when something already on disk below
/// `root` would redirect the write: a symlink at any component, a parent
/// that is not a directory, or a target that is a directory.
pub fn confined_target(root: &Path, relative: &Path) -> Result<PathBuf, String> {
    let mut current = root.to_path_buf();
    let mut parts = relative.components().peekable();
    while let Some(part) = parts.next() {
        current.push(part);
        let last = parts.peek().is_none();
        let meta = match std::fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(format!("{}: {}", current.display(), e)),
        };
        if meta.file_type().is_symlink() {
            return Err(format!("{} is a symbolic link", current.display()));
        }
        if !last && !meta.is_dir() {
            return Err(format!("{} is not a directory", current.display()));
        }
        if last && meta.is_dir() {
            return Err(format!("{} is a directory", current.display()));
        }
    }
    Ok(root.join(relative))
}

/// Forward-slash form used in check names and prefix matching.
pub fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether the file is treated as a test to execute.
pub fn is_test_file(path: &Path) -> bool {
    let in_tests_dir = path
        .parent()
        .is_some_and(|p| p.components().any(|c| c.as_os_str() == "tests"));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    in_tests_dir || stem.starts_with("test_") || stem.ends_with("_test")
}
