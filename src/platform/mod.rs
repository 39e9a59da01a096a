use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that runs an inline shell string.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Send a termination signal to the process identified by `pid`.
    fn kill_process(pid: u32) -> std::io::Result<std::process::Output>;

    /// Whether a process with this PID currently exists.
    fn process_alive(pid: u32) -> bool;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Default `PATH` value for sandboxed check execution.
    fn sandboxed_path() -> String;

    /// Root data directory.
    /// Unix: `~/.autopatch`, Windows: `%APPDATA%\autopatch`.
    fn data_dir() -> PathBuf;
}

/// `AUTOPATCH_DATA_DIR` overrides the platform default (tests, side-by-side installs).
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("AUTOPATCH_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
