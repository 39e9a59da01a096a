//! Isolated validation of candidate file sets.
//!
//! Every run materializes the bundle into a fresh directory, runs the checks
//! in a fixed order (path safety, syntax, dependencies, lint, tests) and
//! folds the outcomes into a [`ValidationReport`]. Check failures, missing
//! tools and timeouts are recorded in the report; `validate` itself never
//! fails.

mod checks;
mod paths;

pub use paths::{PathLayout, confined_target, display_path, is_test_file, safe_relative_path};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::config::SandboxConfig;
use crate::core::patch::{CheckKind, CheckResult, FileMap, ValidationReport, content_hash};
use checks::{ToolRun, builtin_parse, extension, run_tool};

/// The seam the patch controller validates through.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, files: &FileMap) -> ValidationReport;
}

pub struct SandboxRunner {
    root: PathBuf,
    config: SandboxConfig,
}

/// A bundle file that made it into the sandbox.
struct Materialized {
    name: String,
    relative: PathBuf,
    path: PathBuf,
}

impl SandboxRunner {
    /// `root` holds one scratch directory per run.
    pub fn new(root: impl Into<PathBuf>, config: SandboxConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn check(kind: CheckKind, file: &str, run: ToolRun) -> CheckResult {
        let mut result = CheckResult::new(kind, Some(file), run.passed, run.message)
            .took(run.duration_ms);
        if run.skipped {
            result = result.skipped();
        }
        result
    }

    fn blocked(kind: CheckKind, file: &str) -> CheckResult {
        CheckResult::new(kind, Some(file), false, "not run: syntax check failed").skipped()
    }

    async fn syntax(&self, file: &Materialized, dir: &Path) -> ToolRun {
        let ext = extension(&file.path);
        if let Some(argv) = self.config.syntax.get(&ext) {
            return run_tool(argv, &file.path, dir, self.config.check_timeout()).await;
        }
        let content = match std::fs::read_to_string(&file.path) {
            Ok(c) => c,
            Err(e) => {
                return ToolRun {
                    passed: false,
                    skipped: false,
                    message: format!("unreadable in sandbox: {}", e),
                    duration_ms: 0,
                };
            }
        };
        match builtin_parse(&ext, &content) {
            Some(Ok(())) => ToolRun {
                passed: true,
                skipped: false,
                message: format!("{} structure ok", ext),
                duration_ms: 0,
            },
            Some(Err(e)) => ToolRun {
                passed: false,
                skipped: false,
                message: e,
                duration_ms: 0,
            },
            None => ToolRun::skip(no_checker("syntax", &ext)),
        }
    }

    async fn tool_check(
        &self,
        table: &BTreeMap<String, Vec<String>>,
        label: &str,
        file: &Materialized,
        dir: &Path,
        limit: std::time::Duration,
    ) -> ToolRun {
        let ext = extension(&file.path);
        match table.get(&ext) {
            Some(argv) => run_tool(argv, &file.path, dir, limit).await,
            None => ToolRun::skip(no_checker(label, &ext)),
        }
    }

    /// Write safe files into `dir`, recording a path-safety check for each.
    fn materialize(
        files: &FileMap,
        dir: &Path,
        checks: &mut Vec<CheckResult>,
    ) -> Vec<Materialized> {
        let mut layout = PathLayout::default();
        let mut written = Vec::new();
        for (name, content) in files {
            let relative = match safe_relative_path(name) {
                Ok(rel) => rel,
                Err(reason) => {
                    warn!("Rejecting unsafe bundle path {:?}: {}", name, reason);
                    checks.push(CheckResult::new(
                        CheckKind::PathSafety,
                        Some(name),
                        false,
                        reason,
                    ));
                    continue;
                }
            };
            if let Err(reason) = layout.claim(&relative) {
                checks.push(CheckResult::new(CheckKind::PathSafety, Some(name), false, reason));
                continue;
            }
            let target = dir.join(&relative);
            let write = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(&target, content.as_bytes()));
            match write {
                Ok(()) => {
                    checks.push(CheckResult::new(
                        CheckKind::PathSafety,
                        Some(name),
                        true,
                        "inside sandbox root",
                    ));
                    written.push(Materialized {
                        name: name.clone(),
                        relative,
                        path: target,
                    });
                }
                Err(e) => checks.push(CheckResult::new(
                    CheckKind::PathSafety,
                    Some(name),
                    false,
                    format!("could not be written: {}", e),
                )),
            }
        }
        written
    }

    async fn run_checks(&self, files: &FileMap, dir: &Path) -> Vec<CheckResult> {
        let mut checks = Vec::new();
        if files.is_empty() {
            checks.push(CheckResult::new(
                CheckKind::Bundle,
                None,
                false,
                "bundle contains no files",
            ));
            return checks;
        }

        let materialized = Self::materialize(files, dir, &mut checks);

        let mut parsed = HashSet::new();
        for file in &materialized {
            let run = self.syntax(file, dir).await;
            if run.passed {
                parsed.insert(file.name.clone());
            }
            checks.push(Self::check(CheckKind::Syntax, &file.name, run));
        }

        for file in &materialized {
            if !parsed.contains(&file.name) {
                checks.push(Self::blocked(CheckKind::Dependencies, &file.name));
                continue;
            }
            let limit = self.config.check_timeout();
            let run = self
                .tool_check(&self.config.dependencies, "dependency", file, dir, limit)
                .await;
            checks.push(Self::check(CheckKind::Dependencies, &file.name, run));
        }

        for file in &materialized {
            let result = if parsed.contains(&file.name) {
                let limit = self.config.check_timeout();
                let run = self
                    .tool_check(&self.config.lint, "lint", file, dir, limit)
                    .await;
                Self::check(CheckKind::Lint, &file.name, run)
            } else {
                Self::blocked(CheckKind::Lint, &file.name)
            };
            checks.push(if self.config.lint_mandatory {
                result
            } else {
                result.advisory()
            });
        }

        let tests: Vec<&Materialized> = materialized
            .iter()
            .filter(|f| is_test_file(&f.relative))
            .collect();
        for file in tests {
            if !parsed.contains(&file.name) {
                checks.push(Self::blocked(CheckKind::Tests, &file.name));
                continue;
            }
            let limit = self.config.test_timeout();
            let run = self
                .tool_check(&self.config.tests, "test runner", file, dir, limit)
                .await;
            checks.push(Self::check(CheckKind::Tests, &file.name, run));
        }

        checks
    }
}

fn no_checker(label: &str, ext: &str) -> String {
    if ext.is_empty() {
        format!("no {} checker for files without extension", label)
    } else {
        format!("no {} checker for .{}", label, ext)
    }
}

#[async_trait]
impl Validator for SandboxRunner {
    async fn validate(&self, files: &FileMap) -> ValidationReport {
        let started_at = Utc::now();
        let hash = content_hash(files);
        let dir = self.root.join(uuid::Uuid::new_v4().simple().to_string());

        let checks = match std::fs::create_dir_all(&dir) {
            Ok(()) => self.run_checks(files, &dir).await,
            Err(e) => vec![CheckResult::new(
                CheckKind::Bundle,
                None,
                false,
                format!("could not create sandbox {}: {}", dir.display(), e),
            )],
        };

        let mut report = ValidationReport::from_checks(hash, checks, started_at);
        if self.config.keep_sandbox {
            debug!("Keeping sandbox {}", dir.display());
            report.sandbox_dir = Some(dir);
        } else if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!("Failed to remove sandbox {}: {}", dir.display(), e);
        }

        info!(
            "Sandbox validation finished: {} checks, passed={}",
            report.checks.len(),
            report.overall_passed
        );
        report
    }
}
