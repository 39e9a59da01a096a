use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::cycle::Phase;
use crate::core::atomic::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Idle,
    RunningCycle,
    Sleeping,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Idle => "IDLE",
            WorkerState::RunningCycle => "RUNNING_CYCLE",
            WorkerState::Sleeping => "SLEEPING",
            WorkerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Liveness record. Written only by the worker; the monitor only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub last_beat_at: DateTime<Utc>,
    pub current_phase: Option<Phase>,
    pub state: WorkerState,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub cycle_count: u64,
}

impl Heartbeat {
    /// `None` when missing or unreadable; either way the worker is not
    /// proving it is alive.
    pub fn read(path: &Path) -> Option<Heartbeat> {
        let raw = std::fs::read(path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(beat) => Some(beat),
            Err(e) => {
                warn!("Unreadable heartbeat {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.last_beat_at
    }
}

pub struct HeartbeatWriter {
    path: PathBuf,
    pid: u32,
    host: String,
}

impl HeartbeatWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path: path.into(),
            pid: std::process::id(),
            host,
        }
    }

    /// Failures are logged; a missed beat is not fatal to the worker.
    pub fn beat(&self, state: WorkerState, phase: Option<Phase>, cycle_count: u64) {
        let beat = Heartbeat {
            pid: self.pid,
            last_beat_at: Utc::now(),
            current_phase: phase,
            state,
            host: self.host.clone(),
            cycle_count,
        };
        if let Err(e) = write_json_atomic(&self.path, &beat) {
            warn!("Failed to write heartbeat {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_is_readable_and_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("heartbeat.json");
        let writer = HeartbeatWriter::new(&path);

        writer.beat(WorkerState::RunningCycle, Some(Phase::Train), 4);

        let beat = Heartbeat::read(&path).unwrap();
        assert_eq!(beat.pid, std::process::id());
        assert_eq!(beat.state, WorkerState::RunningCycle);
        assert_eq!(beat.current_phase, Some(Phase::Train));
        assert_eq!(beat.cycle_count, 4);
        assert!(beat.age() < chrono::Duration::seconds(5));
    }

    #[test]
    fn missing_or_garbled_heartbeat_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        assert!(Heartbeat::read(&path).is_none());
        std::fs::write(&path, "{").unwrap();
        assert!(Heartbeat::read(&path).is_none());
    }
}
