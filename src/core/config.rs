use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE_NAME: &str = "autopatch.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub governance: GovernanceConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub apply: ApplyConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Approval policy handed to the patch controller.
#[derive(Debug, Clone, Deserialize)]
pub struct GovernanceConfig {
    /// Approve a proposal right after it is proposed, when validation passed.
    #[serde(default)]
    pub auto_approve: bool,

    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: f64,

    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: f64,

    /// Treat lint failures as blocking.
    #[serde(default)]
    pub lint_mandatory: bool,

    /// Leave the sandbox directory on disk after validation for inspection.
    #[serde(default)]
    pub keep_sandbox: bool,

    /// extension -> argv, `{file}` and `{dir}` are substituted.
    #[serde(default = "default_syntax_commands")]
    pub syntax: BTreeMap<String, Vec<String>>,

    #[serde(default = "default_dependency_commands")]
    pub dependencies: BTreeMap<String, Vec<String>>,

    #[serde(default = "default_lint_commands")]
    pub lint: BTreeMap<String, Vec<String>>,

    #[serde(default = "default_test_commands")]
    pub tests: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyConfig {
    /// Directory approved patches are merged into. Defaults to the current directory.
    #[serde(default)]
    pub project_root: Option<PathBuf>,

    /// Path prefixes a merge may touch. An empty string allows everything.
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,

    #[serde(default = "default_deny_dirs")]
    pub deny_dirs: Vec<String>,

    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Shell commands run in `project_root` after files are written.
    #[serde(default)]
    pub postcheck_commands: Vec<String>,

    #[serde(default = "default_postcheck_timeout")]
    pub postcheck_timeout_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub evolution_enabled: bool,

    #[serde(default = "default_min_examples")]
    pub min_examples_for_training: usize,

    #[serde(default = "default_min_examples")]
    pub min_examples_for_evolution: usize,

    #[serde(default = "default_min_examples")]
    pub min_examples_for_patch: usize,

    #[serde(default = "default_max_files")]
    pub max_patch_files: usize,

    /// Cleaned text documents picked up by the ingest phase.
    #[serde(default)]
    pub inbox_dir: Option<PathBuf>,

    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: f64,

    /// External commands per phase: `vectorize`, `synthesize`, `train`, `evolve`, `generate`.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_snapshot_cron")]
    pub snapshot_cron: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_branch_prefix() -> String {
    "auto/edit".to_string()
}
fn default_commit_message() -> String {
    "Auto-edit: proposed changes by assistant".to_string()
}
fn default_check_timeout() -> f64 {
    30.0
}
fn default_test_timeout() -> f64 {
    60.0
}
fn default_postcheck_timeout() -> f64 {
    60.0
}
fn default_phase_timeout() -> f64 {
    600.0
}
fn default_max_files() -> usize {
    20
}
fn default_interval() -> u64 {
    120
}
fn default_min_examples() -> usize {
    1
}
fn default_poll_interval() -> u64 {
    30
}
fn default_stale_after() -> u64 {
    900
}
fn default_snapshot_cron() -> String {
    "0 0/30 * * * *".to_string()
}
fn default_allowed_paths() -> Vec<String> {
    vec!["src/".to_string(), "tests/".to_string(), "scripts/".to_string()]
}
fn default_deny_dirs() -> Vec<String> {
    vec![
        ".git/".to_string(),
        "data/".to_string(),
        "models/".to_string(),
        "backups/".to_string(),
    ]
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn default_syntax_commands() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("py".to_string(), argv(&["python3", "-m", "py_compile", "{file}"])),
        ("sh".to_string(), argv(&["sh", "-n", "{file}"])),
    ])
}

fn default_dependency_commands() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        "py".to_string(),
        argv(&[
            "python3",
            "-c",
            "import importlib.util,sys;sys.path.insert(0,sys.argv[2]);\
             s=importlib.util.spec_from_file_location('candidate',sys.argv[1]);\
             m=importlib.util.module_from_spec(s);s.loader.exec_module(m)",
            "{file}",
            "{dir}",
        ]),
    )])
}

fn default_lint_commands() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        "py".to_string(),
        argv(&["flake8", "--max-line-length=120", "{file}"]),
    )])
}

fn default_test_commands() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        "py".to_string(),
        argv(&["python3", "-m", "pytest", "-q", "{file}"]),
    )])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            governance: GovernanceConfig::default(),
            sandbox: SandboxConfig::default(),
            apply: ApplyConfig::default(),
            worker: WorkerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            branch_prefix: default_branch_prefix(),
            commit_message: default_commit_message(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: default_check_timeout(),
            test_timeout_secs: default_test_timeout(),
            lint_mandatory: false,
            keep_sandbox: false,
            syntax: default_syntax_commands(),
            dependencies: default_dependency_commands(),
            lint: default_lint_commands(),
            tests: default_test_commands(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            allowed_paths: default_allowed_paths(),
            deny_dirs: default_deny_dirs(),
            max_files: default_max_files(),
            postcheck_commands: Vec::new(),
            postcheck_timeout_secs: default_postcheck_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            evolution_enabled: false,
            min_examples_for_training: default_min_examples(),
            min_examples_for_evolution: default_min_examples(),
            min_examples_for_patch: default_min_examples(),
            max_patch_files: default_max_files(),
            inbox_dir: None,
            phase_timeout_secs: default_phase_timeout(),
            commands: BTreeMap::new(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stale_after_secs: default_stale_after(),
            snapshot_cron: default_snapshot_cron(),
        }
    }
}

impl SandboxConfig {
    pub fn check_timeout(&self) -> Duration {
        secs(self.check_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        secs(self.test_timeout_secs)
    }

    /// Config with no external tool tables; only the built-in parsers run.
    #[cfg(test)]
    pub fn builtin_only() -> Self {
        Self {
            syntax: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            lint: BTreeMap::new(),
            tests: BTreeMap::new(),
            ..Self::default()
        }
    }
}

impl ApplyConfig {
    pub fn postcheck_timeout(&self) -> Duration {
        secs(self.postcheck_timeout_secs)
    }
}

impl WorkerConfig {
    pub fn phase_timeout(&self) -> Duration {
        secs(self.phase_timeout_secs)
    }
}

/// Longest timeout or interval honoured; larger values are clamped.
const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.min(MAX_DURATION_SECS))
    } else {
        Duration::from_secs(1)
    }
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE_NAME);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", config_path.display(), e))?;
        info!("Loaded configuration from {}", config_path.display());
        Ok(config)
    }
}

/// On-disk layout below the data root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn native() -> Self {
        Self::new(NativePlatform::data_dir())
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }
    pub fn auto_edits_dir(&self) -> PathBuf {
        self.root.join("auto_edits")
    }
    pub fn sandbox_dir(&self) -> PathBuf {
        self.root.join("sandbox")
    }
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }
    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("inbox")
    }
    pub fn heartbeat_file(&self) -> PathBuf {
        self.run_dir().join("heartbeat.json")
    }
    pub fn worker_pid_file(&self) -> PathBuf {
        self.run_dir().join("worker.pid")
    }
    pub fn monitor_pid_file(&self) -> PathBuf {
        self.run_dir().join("monitor.pid")
    }
    /// Presence of this file asks the named daemon (`worker`, `monitor`) to exit.
    pub fn stop_marker(&self, daemon: &str) -> PathBuf {
        self.run_dir().join(format!("{}.stop", daemon))
    }
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{}.log", name))
    }
    pub fn cycles_file(&self) -> PathBuf {
        self.root.join("cycles.jsonl")
    }
    pub fn apply_history_file(&self) -> PathBuf {
        self.root.join("apply_history.jsonl")
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.patches_dir(),
            self.auto_edits_dir(),
            self.sandbox_dir(),
            self.backups_dir(),
            self.run_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        NativePlatform::restrict_dir_permissions(&self.root);
        NativePlatform::restrict_dir_permissions(&self.run_dir());
        Ok(())
    }
}
