use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::process::Command;

const OUTPUT_TAIL_CHARS: usize = 2000;

/// Upper bound on stdout kept by [`run_with_input`]. Larger output fails the run.
pub const MAX_CAPTURED_STDOUT: usize = 16 * 1024 * 1024;

/// How much of stdout a run keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    /// The last [`OUTPUT_TAIL_CHARS`] characters, for diagnostics.
    Tail,
    /// Everything, up to [`MAX_CAPTURED_STDOUT`] bytes.
    Full,
}

/// Result of one external process run. Failing to start, a non-zero exit
/// and a timeout all land here; nothing is raised to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutcome {
    /// Short human-readable diagnostic.
    pub fn summary(&self) -> String {
        if self.timed_out {
            return format!(
                "`{}` timed out after {} ms",
                self.command, self.duration_ms
            );
        }
        if self.success {
            return format!("`{}` ok", self.command);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.exit_code {
            Some(code) => format!("`{}` exited with {}: {}", self.command, code, detail),
            None => format!("`{}` failed: {}", self.command, detail),
        }
    }
}

/// Run `cmd` to completion, killing it once `limit` elapses.
pub async fn run_with_timeout(mut cmd: Command, label: &str, limit: Duration) -> CommandOutcome {
    cmd.kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    let started = Instant::now();

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                command: label.to_string(),
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to start: {}", e),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }
    };
    collect(child, label, limit, started, Capture::Tail).await
}

/// Like [`run_with_timeout`] but feeds `input` to the child's stdin and keeps
/// stdout whole, since callers parse it as a payload.
pub async fn run_with_input(
    mut cmd: Command,
    label: &str,
    input: &[u8],
    limit: Duration,
) -> CommandOutcome {
    use tokio::io::AsyncWriteExt;

    cmd.kill_on_drop(true)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    let started = Instant::now();

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                command: label.to_string(),
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to start: {}", e),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(input).await;
        drop(stdin);
    }
    collect(child, label, limit, started, Capture::Full).await
}

/// Like [`run_with_timeout`] but streams stdout into `out` untruncated.
pub async fn run_to_file(
    mut cmd: Command,
    label: &str,
    out: &std::path::Path,
    limit: Duration,
) -> CommandOutcome {
    let started = Instant::now();
    let spawned = std::fs::File::create(out).and_then(|file| {
        cmd.kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(file))
            .stderr(std::process::Stdio::piped())
            .spawn()
    });
    match spawned {
        Ok(child) => collect(child, label, limit, started, Capture::Tail).await,
        Err(e) => CommandOutcome {
            command: label.to_string(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("failed to start: {}", e),
            timed_out: false,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    }
}

async fn collect(
    child: tokio::process::Child,
    label: &str,
    limit: Duration,
    started: Instant,
    capture: Capture,
) -> CommandOutcome {
    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut outcome = CommandOutcome {
                command: label.to_string(),
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::new(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            match capture {
                Capture::Tail => outcome.stdout = tail(&String::from_utf8_lossy(&output.stdout)),
                Capture::Full if output.stdout.len() > MAX_CAPTURED_STDOUT => {
                    outcome.success = false;
                    outcome.stderr = format!(
                        "stdout exceeded {} bytes ({} bytes)",
                        MAX_CAPTURED_STDOUT,
                        output.stdout.len()
                    );
                }
                Capture::Full => {
                    outcome.stdout = String::from_utf8_lossy(&output.stdout).into_owned()
                }
            }
            outcome
        }
        Ok(Err(e)) => CommandOutcome {
            command: label.to_string(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("failed while waiting: {}", e),
            timed_out: false,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        // Dropping the future drops the child; kill_on_drop reaps it.
        Err(_) => CommandOutcome {
            command: label.to_string(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("timed out after {:?}", limit),
            timed_out: true,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    }
}

fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}
