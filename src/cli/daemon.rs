use anyhow::Result;
use console::style;
use std::path::Path;
use std::time::Duration;

use super::context::AppContext;
use crate::core::monitor::{Monitor, ProcessLauncher, Verdict, assess};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};
use crate::core::worker::{
    Collaborators, Heartbeat, PhaseOutcome, PidFile, StopSignal, Worker, WorkerCycle,
};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

/// `worker` or `monitor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Daemon {
    Worker,
    Monitor,
}

impl Daemon {
    pub fn name(self) -> &'static str {
        match self {
            Daemon::Worker => "worker",
            Daemon::Monitor => "monitor",
        }
    }

    fn pid_file(self, ctx: &AppContext) -> std::path::PathBuf {
        match self {
            Daemon::Worker => ctx.layout.worker_pid_file(),
            Daemon::Monitor => ctx.layout.monitor_pid_file(),
        }
    }
}

fn running_pid(pid_file: &Path) -> Option<u32> {
    PidFile::read(pid_file).filter(|pid| NativePlatform::process_alive(*pid))
}

/// Cancel `stop` on Ctrl+C so foreground runs wind down between phases.
fn cancel_on_ctrl_c(stop: &StopSignal) {
    let token = stop.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

pub async fn run_worker(ctx: &AppContext, once: bool, detached: bool) -> Result<()> {
    logging::init(
        &ctx.config.log_level,
        Some(&ctx.layout.log_file("worker")),
        detached,
    );
    let _pid = PidFile::acquire(ctx.layout.worker_pid_file())?;
    let stop = StopSignal::new(ctx.layout.stop_marker("worker"));
    stop.clear();
    cancel_on_ctrl_c(&stop);

    let controller = ctx.controller().await?;
    let collaborators = Collaborators::from_config(&ctx.config.worker, ctx.layout.inbox_dir());
    let mut worker = Worker::new(
        &ctx.layout,
        ctx.config.worker.clone(),
        controller,
        collaborators,
        stop,
    );

    if once {
        let cycle = worker.run_cycle().await;
        print_cycle(&cycle);
        return Ok(());
    }
    worker.run().await
}

pub async fn run_monitor(ctx: &AppContext, detached: bool) -> Result<()> {
    logging::init(
        &ctx.config.log_level,
        Some(&ctx.layout.log_file("monitor")),
        detached,
    );
    let _pid = PidFile::acquire(ctx.layout.monitor_pid_file())?;
    let stop = StopSignal::new(ctx.layout.stop_marker("monitor"));
    stop.clear();
    cancel_on_ctrl_c(&stop);

    let launcher = ProcessLauncher::new(ctx.layout.log_file("worker"));
    let mut monitor = Monitor::new(
        ctx.layout.clone(),
        ctx.config.monitor.clone(),
        Box::new(launcher),
        stop,
    );
    monitor.run().await
}

pub async fn start(ctx: &AppContext, daemon: Daemon) -> Result<()> {
    let name = daemon.name();
    if let Some(pid) = running_pid(&daemon.pid_file(ctx)) {
        print_warn(&format!(
            "The {} is already running (PID {}). Use 'autopatch {} stop' first.",
            name, pid, name
        ));
        return Ok(());
    }

    let log_path = ctx.layout.log_file(name);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .args([name, "run", "--detached"])
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    GuideSection::new(&format!("{} Started", capitalize(name)))
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(child.id()).dim()
            ),
        )
        .status("Log", &log_path.display().to_string())
        .blank()
        .info(&format!(
            "Run {} to follow its output.",
            style(format!("autopatch logs {}", name)).cyan().bold()
        ))
        .print();
    println!();
    Ok(())
}

/// Cooperative: drops the stop marker and lets the daemon finish its phase.
pub async fn stop(ctx: &AppContext, daemon: Daemon) -> Result<()> {
    let name = daemon.name();
    let pid_file = daemon.pid_file(ctx);
    let Some(pid) = running_pid(&pid_file) else {
        if pid_file.exists() {
            std::fs::remove_file(&pid_file).ok();
        }
        print_info(&format!("The {} is not currently running.", name));
        return Ok(());
    };

    StopSignal::request(&ctx.layout.stop_marker(name))?;
    GuideSection::new(&format!("{} Stopping", capitalize(name)))
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("STOP REQUESTED").yellow().bold(),
                style(pid).dim()
            ),
        )
        .info("It exits once the current phase completes.")
        .print();
    println!();
    Ok(())
}

fn last_cycle(path: &Path) -> Option<WorkerCycle> {
    let log = std::fs::read_to_string(path).ok()?;
    let line = log.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line).ok()
}

pub async fn status(ctx: &AppContext, daemon: Daemon) -> Result<()> {
    let name = daemon.name();
    let running = running_pid(&daemon.pid_file(ctx));
    let process = match running {
        Some(pid) => format!("{} (PID {})", style("RUNNING").green().bold(), style(pid).dim()),
        None => style("STOPPED").red().bold().to_string(),
    };

    let beat = Heartbeat::read(&ctx.layout.heartbeat_file());
    let stale_after = Duration::from_secs(ctx.config.monitor.stale_after_secs.max(1));
    let verdict = assess(beat.as_ref(), stale_after, None, NativePlatform::process_alive);
    let verdict_text = match &verdict {
        Verdict::Healthy => style(verdict.to_string()).green().to_string(),
        Verdict::Stopped | Verdict::Starting => style(verdict.to_string()).dim().to_string(),
        _ => style(verdict.to_string()).red().to_string(),
    };

    let mut section = GuideSection::new(&format!("{} Status", capitalize(name)))
        .status(capitalize(name).as_str(), &process)
        .status("Worker health", &verdict_text);
    if let Some(beat) = &beat {
        section = section
            .status("State", &beat.state.to_string())
            .status(
                "Phase",
                &beat
                    .current_phase
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )
            .status("Last beat", &format!("{}s ago", beat.age().num_seconds()))
            .status("Cycles", &beat.cycle_count.to_string());
    }
    if daemon == Daemon::Worker
        && let Some(cycle) = last_cycle(&ctx.layout.cycles_file())
    {
        section = section.status(
            "Last cycle",
            &format!(
                "#{} {}",
                cycle.number,
                cycle.error.as_deref().unwrap_or("without errors")
            ),
        );
    }
    if running.is_none() {
        section = section.blank().info(&format!(
            "Run {} to start it.",
            style(format!("autopatch {} start", name)).cyan().bold()
        ));
    }
    section.print();
    println!();
    Ok(())
}

fn print_cycle(cycle: &WorkerCycle) {
    let mut section = GuideSection::new(&format!("Cycle {}", cycle.number));
    for record in &cycle.phases {
        let label = record.outcome.label();
        let label = match label {
            "completed" => style(label).green(),
            "failed" => style(label).red(),
            _ => style(label).yellow(),
        };
        let detail = match &record.outcome {
            PhaseOutcome::Completed { detail } => detail.clone(),
            PhaseOutcome::Failed { error } => error.clone(),
            PhaseOutcome::Skipped { reason } => reason.clone(),
            PhaseOutcome::DependencyFailed { dependency, reason } => {
                format!("{} ({})", reason, dependency)
            }
        };
        section = section.text(&format!(
            "{:<14} {:<18} {}",
            record.phase.as_str(),
            label,
            style(detail).dim()
        ));
    }
    section.print();
    println!();
    match &cycle.error {
        Some(e) => print_error(&format!("Cycle finished with an error: {}", e)),
        None => print_success("Cycle finished."),
    }
}

pub async fn follow_logs(ctx: &AppContext, name: &str) -> Result<()> {
    let log_file = ctx.layout.log_file(name);
    if !log_file.exists() {
        GuideSection::new("Live Logs")
            .warn(&format!("No {} log yet.", name))
            .blank()
            .info(&format!(
                "Run {} to start it.",
                style(format!("autopatch {} start", name)).cyan().bold()
            ))
            .print();
        println!();
        return Ok(());
    }
    GuideSection::new("Live Logs")
        .text(&format!(
            "Following {} - press {} to stop.",
            style(log_file.display()).cyan(),
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();
    let mut child = NativePlatform::tail_file(&log_file)?;
    let _ = child.wait()?;
    Ok(())
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
