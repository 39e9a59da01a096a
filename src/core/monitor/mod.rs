//! Out-of-band supervision of the worker.
//!
//! The monitor only ever reads the heartbeat the worker writes. When the
//! heartbeat is missing, its PID is gone or it has not been refreshed within
//! `stale_after_secs`, the worker is (killed if hung and) started again.

mod snapshot;

pub use snapshot::take_snapshot;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::core::config::{DataLayout, MonitorConfig};
use crate::core::worker::{Heartbeat, StopSignal, WorkerState};
use crate::platform::{NativePlatform, Platform};

const KILL_GRACE: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(100);
const STOP_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// A worker was just launched and has not beaten yet.
    Starting,
    /// The worker exited on request and says so in its last beat.
    Stopped,
    Missing,
    Dead { pid: u32 },
    Stale { pid: u32, age_secs: i64 },
}

impl Verdict {
    pub fn needs_restart(&self) -> bool {
        matches!(
            self,
            Verdict::Missing | Verdict::Dead { .. } | Verdict::Stale { .. }
        )
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Healthy => f.write_str("healthy"),
            Verdict::Starting => f.write_str("starting"),
            Verdict::Stopped => f.write_str("stopped"),
            Verdict::Missing => f.write_str("no heartbeat"),
            Verdict::Dead { pid } => write!(f, "PID {} is not running", pid),
            Verdict::Stale { pid, age_secs } => {
                write!(f, "PID {} has not beaten for {}s", pid, age_secs)
            }
        }
    }
}

/// A worker started by this monitor.
#[derive(Debug, Clone, Copy)]
pub struct Launch {
    pub pid: u32,
    pub at: Instant,
}

/// Judge a heartbeat. `launched` is the most recent worker this monitor
/// started; it is given `stale_after` to produce its first beat.
pub fn assess(
    beat: Option<&Heartbeat>,
    stale_after: Duration,
    launched: Option<&Launch>,
    alive: impl Fn(u32) -> bool,
) -> Verdict {
    let pending = launched.filter(|l| l.at.elapsed() < stale_after && alive(l.pid));
    let Some(beat) = beat else {
        return if pending.is_some() {
            Verdict::Starting
        } else {
            Verdict::Missing
        };
    };
    if let Some(launch) = pending
        && launch.pid != beat.pid
    {
        return Verdict::Starting;
    }
    if beat.state == WorkerState::Stopped {
        return Verdict::Stopped;
    }
    if !alive(beat.pid) {
        return Verdict::Dead { pid: beat.pid };
    }
    let age = beat.age();
    if age.to_std().is_ok_and(|a| a > stale_after) {
        return Verdict::Stale {
            pid: beat.pid,
            age_secs: age.num_seconds(),
        };
    }
    Verdict::Healthy
}

/// Starts worker processes on the monitor's behalf.
pub trait WorkerLauncher: Send {
    /// Start a worker and return its PID.
    fn launch(&mut self) -> Result<u32>;

    /// Collect exited children so they stop looking alive.
    fn reap(&mut self) {}
}

/// Re-runs this binary as `worker run --detached`, output appended to the
/// worker log.
pub struct ProcessLauncher {
    log_file: PathBuf,
    children: Vec<Child>,
}

impl ProcessLauncher {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            children: Vec::new(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self) -> Result<u32> {
        if let Some(dir) = self.log_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open {}", self.log_file.display()))?;
        let exe = std::env::current_exe()?;
        let child = std::process::Command::new(exe)
            .args(["worker", "run", "--detached"])
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .context("Failed to spawn worker")?;
        let pid = child.id();
        self.children.push(child);
        Ok(pid)
    }

    fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                info!("Worker {} exited with {}", child.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Could not poll worker {}: {}", child.id(), e);
                false
            }
        });
    }
}

pub struct Monitor {
    layout: DataLayout,
    settings: MonitorConfig,
    launcher: Box<dyn WorkerLauncher>,
    stop: StopSignal,
    launched: Option<Launch>,
    restarts: u64,
}

impl Monitor {
    pub fn new(
        layout: DataLayout,
        settings: MonitorConfig,
        launcher: Box<dyn WorkerLauncher>,
        stop: StopSignal,
    ) -> Self {
        Self {
            layout,
            settings,
            launcher,
            stop,
            launched: None,
            restarts: 0,
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    fn stale_after(&self) -> Duration {
        Duration::from_secs(self.settings.stale_after_secs.max(1))
    }

    /// One poll: read the heartbeat, restart the worker when it is not alive.
    pub async fn check(&mut self) -> Verdict {
        self.launcher.reap();
        let beat = Heartbeat::read(&self.layout.heartbeat_file());
        let verdict = assess(
            beat.as_ref(),
            self.stale_after(),
            self.launched.as_ref(),
            NativePlatform::process_alive,
        );
        if !verdict.needs_restart() {
            debug!("Worker {}", verdict);
            return verdict;
        }
        if self.layout.stop_marker("worker").exists() {
            info!("Worker {}, but a stop was requested; not restarting", verdict);
            return verdict;
        }

        warn!("Worker {}; restarting", verdict);
        if let Verdict::Stale { pid, .. } = verdict {
            self.terminate(pid).await;
        }
        match self.launcher.launch() {
            Ok(pid) => {
                self.restarts += 1;
                self.launched = Some(Launch {
                    pid,
                    at: Instant::now(),
                });
                info!("Worker started with PID {} (restart #{})", pid, self.restarts);
            }
            Err(e) => error!("Failed to start worker: {:#}", e),
        }
        verdict
    }

    /// Ask a hung worker to exit and give it a moment to do so.
    async fn terminate(&mut self, pid: u32) {
        if let Err(e) = NativePlatform::kill_process(pid) {
            warn!("Could not signal worker {}: {}", pid, e);
            return;
        }
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            self.launcher.reap();
            if !NativePlatform::process_alive(pid) {
                return;
            }
            tokio::time::sleep(KILL_POLL).await;
        }
        warn!("Worker {} is still alive after {:?}", pid, KILL_GRACE);
    }

    async fn schedule_snapshots(&self) -> Result<Option<JobScheduler>> {
        let expr = self.settings.snapshot_cron.trim().to_string();
        if expr.is_empty() {
            return Ok(None);
        }
        let scheduler = JobScheduler::new().await?;
        let layout = self.layout.clone();
        match Job::new_async(expr.as_str(), move |_uuid, mut _l| {
            let layout = layout.clone();
            Box::pin(async move {
                match tokio::task::spawn_blocking(move || take_snapshot(&layout)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Snapshot failed: {:#}", e),
                    Err(e) => error!("Snapshot task panicked: {}", e),
                }
            })
        }) {
            Ok(job) => {
                scheduler.add(job).await?;
            }
            Err(e) => {
                error!("Invalid snapshot_cron '{}': {}", expr, e);
                return Ok(None);
            }
        }
        scheduler.start().await?;
        info!("Snapshots scheduled ({})", expr);
        Ok(Some(scheduler))
    }

    /// Poll until the stop signal is observed.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Monitor started (pid {}, poll {}s, stale after {}s)",
            std::process::id(),
            self.settings.poll_interval_secs,
            self.settings.stale_after_secs
        );
        let mut scheduler = self.schedule_snapshots().await?;
        let token = self.stop.token();

        'poll: while !self.stop.is_set() {
            self.check().await;
            for _ in 0..self.settings.poll_interval_secs.max(1) {
                tokio::select! {
                    _ = token.cancelled() => break 'poll,
                    _ = tokio::time::sleep(STOP_POLL) => {}
                }
                if self.stop.is_set() {
                    break 'poll;
                }
            }
        }

        if let Some(scheduler) = scheduler.as_mut()
            && let Err(e) = scheduler.shutdown().await
        {
            warn!("Snapshot scheduler did not shut down cleanly: {}", e);
        }
        info!("Monitor stopped after {} restarts", self.restarts);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
