use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::core::process::run_with_timeout;
use crate::platform::{NativePlatform, Platform};

/// Outcome of a single check before it is labelled for the report.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ToolRun {
    pub passed: bool,
    pub skipped: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl ToolRun {
    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            skipped: true,
            message: message.into(),
            duration_ms: 0,
        }
    }
}

pub(crate) fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Structural parse for formats we can read in-process. `None` when the
/// extension has no built-in parser.
pub(crate) fn builtin_parse(ext: &str, content: &str) -> Option<Result<(), String>> {
    let result = match ext {
        "json" => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        "toml" => toml::from_str::<toml::Table>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        "yaml" | "yml" => parse_yaml_documents(content),
        _ => return None,
    };
    Some(result)
}

fn parse_yaml_documents(content: &str) -> Result<(), String> {
    for document in serde_yaml::Deserializer::from_str(content) {
        serde_yaml::Value::deserialize(document).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Run a configured argv against a materialized file inside the sandbox.
/// Every failure mode, including a missing tool, becomes a failed run.
pub(crate) async fn run_tool(argv: &[String], file: &Path, dir: &Path, limit: Duration) -> ToolRun {
    let started = Instant::now();
    let Some((program, rest)) = argv.split_first() else {
        return ToolRun {
            passed: false,
            skipped: false,
            message: "empty command".to_string(),
            duration_ms: 0,
        };
    };
    let substitute = |arg: &String| {
        arg.replace("{file}", &file.to_string_lossy())
            .replace("{dir}", &dir.to_string_lossy())
    };
    let args: Vec<String> = rest.iter().map(substitute).collect();

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(&args)
        .current_dir(dir)
        .env("PATH", NativePlatform::sandboxed_path())
        .env("PYTHONDONTWRITEBYTECODE", "1");

    let outcome = run_with_timeout(cmd, program, limit).await;
    ToolRun {
        passed: outcome.success,
        skipped: false,
        message: outcome.summary(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_parsers_accept_valid_documents() {
        assert_eq!(builtin_parse("json", r#"{"a": [1, 2]}"#), Some(Ok(())));
        assert_eq!(builtin_parse("toml", "a = 1\n[b]\nc = 'x'\n"), Some(Ok(())));
        assert_eq!(builtin_parse("yaml", "a: 1\n---\nb: [1, 2]\n"), Some(Ok(())));
    }

    #[test]
    fn builtin_parsers_reject_structural_errors() {
        assert!(matches!(builtin_parse("json", "{\"a\": "), Some(Err(_))));
        assert!(matches!(builtin_parse("toml", "a = = 1"), Some(Err(_))));
        assert!(matches!(builtin_parse("yml", "a: [1, 2"), Some(Err(_))));
    }

    #[test]
    fn unknown_extensions_have_no_builtin() {
        assert!(builtin_parse("py", "print(1)").is_none());
        assert_eq!(extension(Path::new("a/B.JSON")), "json");
    }

    #[tokio::test]
    async fn empty_argv_fails_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_tool(&[], &dir.path().join("x"), dir.path(), Duration::from_secs(1)).await;
        assert!(!run.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn placeholders_are_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();
        let argv: Vec<String> = ["sh", "-c", "test -f \"$0\" && test -d \"$1\"", "{file}", "{dir}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let run = run_tool(&argv, &file, dir.path(), Duration::from_secs(5)).await;
        assert!(run.passed, "{}", run.message);
    }
}
