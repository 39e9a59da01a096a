use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::config::WorkerConfig;
use crate::core::patch::FileMap;
use crate::core::process::run_with_input;
use crate::platform::{NativePlatform, Platform};

/// Yields cleaned text documents; returns how many are available.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self) -> Result<usize>;
}

/// Knowledge store rebuilt from ingested documents; returns indexed entries.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    async fn rebuild(&self, documents: usize) -> Result<usize>;
}

/// Produces training examples; returns how many were created.
#[async_trait]
pub trait DatasetSynthesizer: Send + Sync {
    async fn synthesize(&self, documents: usize) -> Result<usize>;
}

#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, examples: usize) -> Result<String>;
}

#[async_trait]
pub trait Evolver: Send + Sync {
    async fn evolve(&self, examples: usize) -> Result<String>;
}

/// Opaque source of candidate patches. `Ok(None)` means nothing to propose.
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    async fn generate(&self) -> Result<Option<GeneratedPatch>>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedPatch {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub files: FileMap,
}

/// The worker's external collaborators. An absent one skips its phase.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub ingestor: Option<Arc<dyn Ingestor>>,
    pub index: Option<Arc<dyn KnowledgeIndex>>,
    pub synthesizer: Option<Arc<dyn DatasetSynthesizer>>,
    pub trainer: Option<Arc<dyn Trainer>>,
    pub evolver: Option<Arc<dyn Evolver>>,
    pub generator: Option<Arc<dyn PatchGenerator>>,
}

impl Collaborators {
    /// Inbox ingestion plus whatever external commands are configured.
    pub fn from_config(config: &WorkerConfig, default_inbox: PathBuf) -> Self {
        let inbox = config.inbox_dir.clone().unwrap_or(default_inbox);
        let timeout = config.phase_timeout();
        let command = |name: &str| {
            config
                .commands
                .get(name)
                .filter(|c| !c.trim().is_empty())
                .map(|c| Arc::new(CommandCollaborator::new(name, c, timeout)))
        };
        Self {
            ingestor: Some(Arc::new(DirectoryIngestor::new(inbox))),
            index: command("vectorize").map(|c| c as Arc<dyn KnowledgeIndex>),
            synthesizer: command("synthesize").map(|c| c as Arc<dyn DatasetSynthesizer>),
            trainer: command("train").map(|c| c as Arc<dyn Trainer>),
            evolver: command("evolve").map(|c| c as Arc<dyn Evolver>),
            generator: command("generate").map(|c| c as Arc<dyn PatchGenerator>),
        }
    }
}

/// Counts non-empty `.txt` / `.md` documents in the inbox directory.
pub struct DirectoryIngestor {
    inbox: PathBuf,
}

impl DirectoryIngestor {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
        }
    }
}

#[async_trait]
impl Ingestor for DirectoryIngestor {
    async fn ingest(&self) -> Result<usize> {
        if !self.inbox.exists() {
            debug!("Inbox {} does not exist", self.inbox.display());
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(&self.inbox)
            .await
            .with_context(|| format!("Failed to read inbox {}", self.inbox.display()))?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_doc = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("txt") || e.eq_ignore_ascii_case("md"));
            if !is_doc || !entry.file_type().await?.is_file() {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if !text.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Runs a configured shell command per phase. The request goes to stdin as
/// JSON; counts are read from the last stdout line.
pub struct CommandCollaborator {
    name: String,
    command: String,
    timeout: Duration,
}

impl CommandCollaborator {
    pub fn new(name: &str, command: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout,
        }
    }

    async fn invoke(&self, request: serde_json::Value) -> Result<String> {
        let input = serde_json::to_vec(&request)?;
        let cmd = NativePlatform::shell_inline(&self.command);
        let outcome = run_with_input(cmd, &self.name, &input, self.timeout).await;
        if !outcome.success {
            bail!("{}", outcome.summary());
        }
        Ok(outcome.stdout)
    }

    async fn count(&self, request: serde_json::Value) -> Result<usize> {
        let stdout = self.invoke(request).await?;
        parse_count(&stdout).ok_or_else(|| anyhow!("{} printed no count", self.name))
    }
}

pub(crate) fn parse_count(stdout: &str) -> Option<usize> {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    if let Ok(n) = last.parse::<usize>() {
        return Some(n);
    }
    let value: serde_json::Value = serde_json::from_str(last).ok()?;
    value.get("count")?.as_u64().map(|n| n as usize)
}

#[async_trait]
impl KnowledgeIndex for CommandCollaborator {
    async fn rebuild(&self, documents: usize) -> Result<usize> {
        self.count(serde_json::json!({ "phase": "vectorize", "documents": documents }))
            .await
    }
}

#[async_trait]
impl DatasetSynthesizer for CommandCollaborator {
    async fn synthesize(&self, documents: usize) -> Result<usize> {
        self.count(serde_json::json!({ "phase": "synthesize", "documents": documents }))
            .await
    }
}

#[async_trait]
impl Trainer for CommandCollaborator {
    async fn train(&self, examples: usize) -> Result<String> {
        let out = self
            .invoke(serde_json::json!({ "phase": "train", "examples": examples }))
            .await?;
        Ok(out.lines().last().unwrap_or("trained").trim().to_string())
    }
}

#[async_trait]
impl Evolver for CommandCollaborator {
    async fn evolve(&self, examples: usize) -> Result<String> {
        let out = self
            .invoke(serde_json::json!({ "phase": "evolve", "examples": examples }))
            .await?;
        Ok(out.lines().last().unwrap_or("evolved").trim().to_string())
    }
}

#[async_trait]
impl PatchGenerator for CommandCollaborator {
    async fn generate(&self) -> Result<Option<GeneratedPatch>> {
        let out = self
            .invoke(serde_json::json!({ "phase": "generate" }))
            .await?;
        if out.trim().is_empty() {
            return Ok(None);
        }
        let patch: GeneratedPatch = serde_json::from_str(out.trim())
            .with_context(|| format!("{} did not print a patch object", self.name))?;
        Ok((!patch.files.is_empty()).then_some(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_come_from_the_last_line() {
        assert_eq!(parse_count("working...\n12\n"), Some(12));
        assert_eq!(parse_count("{\"count\": 4}"), Some(4));
        assert_eq!(parse_count("done"), None);
        assert_eq!(parse_count(""), None);
    }

    #[tokio::test]
    async fn inbox_counts_non_empty_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.md"), "# beta").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "  \n").unwrap();
        std::fs::write(dir.path().join("image.png"), "x").unwrap();
        let ingestor = DirectoryIngestor::new(dir.path());
        assert_eq!(ingestor.ingest().await.unwrap(), 2);

        let missing = DirectoryIngestor::new(dir.path().join("nope"));
        assert_eq!(missing.ingest().await.unwrap(), 0);
    }

    #[test]
    fn unconfigured_commands_leave_phases_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::default();
        config.commands.insert("train".to_string(), "./train.sh".to_string());
        config.commands.insert("evolve".to_string(), "  ".to_string());
        let c = Collaborators::from_config(&config, dir.path().to_path_buf());
        assert!(c.ingestor.is_some());
        assert!(c.trainer.is_some());
        assert!(c.evolver.is_none());
        assert!(c.generator.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generator_reads_patch_json_from_stdout() {
        let script = r#"cat >/dev/null; printf '%s\n' '{"title":"t","description":"d","files":{"src/a.py":"x = 1\n"}}'"#;
        let generator = CommandCollaborator::new("generate", script, Duration::from_secs(5));
        let patch = generator.generate().await.unwrap().unwrap();
        assert_eq!(patch.title, "t");
        assert_eq!(patch.files["src/a.py"], "x = 1\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generator_accepts_patches_larger_than_the_diagnostic_tail() {
        let dir = tempfile::tempdir().unwrap();
        let body = "value = 1\n".repeat(700);
        let mut files = FileMap::new();
        files.insert("src/big.py".to_string(), body.clone());
        files.insert("src/other.py".to_string(), body.clone());
        let json = serde_json::json!({ "title": "big", "description": "", "files": files });
        let payload = dir.path().join("patch.json");
        std::fs::write(&payload, serde_json::to_vec(&json).unwrap()).unwrap();
        assert!(std::fs::metadata(&payload).unwrap().len() > 7000);

        let script = format!("cat >/dev/null; cat '{}'", payload.display());
        let generator = CommandCollaborator::new("generate", &script, Duration::from_secs(5));
        let patch = generator.generate().await.unwrap().unwrap();
        assert_eq!(patch.title, "big");
        assert_eq!(patch.files.len(), 2);
        assert_eq!(patch.files["src/big.py"], body);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_request_on_stdin() {
        let script = r#"grep -q '"documents":3' && echo 7"#;
        let synth = CommandCollaborator::new("synthesize", script, Duration::from_secs(5));
        assert_eq!(synth.synthesize(3).await.unwrap(), 7);
    }
}
