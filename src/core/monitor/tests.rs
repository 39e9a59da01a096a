use super::*;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::atomic::write_json_atomic;

fn beat(pid: u32, age_secs: i64, state: WorkerState) -> Heartbeat {
    Heartbeat {
        pid,
        last_beat_at: Utc::now() - chrono::Duration::seconds(age_secs),
        current_phase: None,
        state,
        host: String::new(),
        cycle_count: 0,
    }
}

fn write_beat(path: &Path, beat: &Heartbeat) {
    write_json_atomic(path, beat).unwrap();
}

/// Starts `sleep` children that immediately write a fresh heartbeat, the way
/// a real worker does on startup.
#[derive(Clone)]
struct FakeLauncher {
    heartbeat: PathBuf,
    children: Arc<Mutex<Vec<Child>>>,
    launches: Arc<AtomicUsize>,
}

impl FakeLauncher {
    fn new(heartbeat: PathBuf) -> Self {
        Self {
            heartbeat,
            children: Arc::new(Mutex::new(Vec::new())),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn kill_all(&self) {
        for child in self.children.lock().unwrap().iter_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&mut self) -> Result<u32> {
        let child = std::process::Command::new("sleep").arg("30").spawn()?;
        let pid = child.id();
        write_beat(&self.heartbeat, &beat(pid, 0, WorkerState::Idle));
        self.children.lock().unwrap().push(child);
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(pid)
    }
}

fn settings() -> MonitorConfig {
    MonitorConfig {
        poll_interval_secs: 1,
        stale_after_secs: 60,
        snapshot_cron: String::new(),
    }
}

fn monitor(layout: &DataLayout, launcher: &FakeLauncher) -> Monitor {
    Monitor::new(
        layout.clone(),
        settings(),
        Box::new(launcher.clone()),
        StopSignal::new(layout.stop_marker("monitor")),
    )
}

#[test]
fn verdicts_follow_the_heartbeat() {
    let stale = Duration::from_secs(60);
    let alive = |pid: u32| pid == 42 || pid == 7;

    assert_eq!(assess(None, stale, None, alive), Verdict::Missing);
    assert_eq!(
        assess(Some(&beat(42, 1, WorkerState::Sleeping)), stale, None, alive),
        Verdict::Healthy
    );
    assert_eq!(
        assess(Some(&beat(13, 1, WorkerState::RunningCycle)), stale, None, alive),
        Verdict::Dead { pid: 13 }
    );
    assert!(matches!(
        assess(Some(&beat(42, 600, WorkerState::RunningCycle)), stale, None, alive),
        Verdict::Stale { pid: 42, age_secs } if age_secs >= 600
    ));
    assert_eq!(
        assess(Some(&beat(13, 1, WorkerState::Stopped)), stale, None, alive),
        Verdict::Stopped
    );
}

#[test]
fn fresh_launch_gets_a_grace_period() {
    let stale = Duration::from_secs(60);
    let alive = |pid: u32| pid == 7;
    let launch = Launch {
        pid: 7,
        at: Instant::now(),
    };

    assert_eq!(assess(None, stale, Some(&launch), alive), Verdict::Starting);
    assert_eq!(
        assess(Some(&beat(13, 600, WorkerState::RunningCycle)), stale, Some(&launch), alive),
        Verdict::Starting
    );
    assert_eq!(
        assess(Some(&beat(7, 0, WorkerState::Idle)), stale, Some(&launch), alive),
        Verdict::Healthy
    );

    let crashed = |_: u32| false;
    assert_eq!(assess(None, stale, Some(&launch), crashed), Verdict::Missing);
}

#[cfg(unix)]
#[tokio::test]
async fn stale_heartbeat_with_dead_pid_restarts_worker() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    layout.ensure().unwrap();

    let mut finished = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = finished.id();
    finished.wait().unwrap();
    write_beat(
        &layout.heartbeat_file(),
        &beat(dead_pid, 3600, WorkerState::RunningCycle),
    );

    let launcher = FakeLauncher::new(layout.heartbeat_file());
    let mut monitor = monitor(&layout, &launcher);

    let verdict = monitor.check().await;
    assert_eq!(verdict, Verdict::Dead { pid: dead_pid });
    assert_eq!(launcher.launches(), 1);
    let new_beat = Heartbeat::read(&layout.heartbeat_file()).unwrap();
    assert_ne!(new_beat.pid, dead_pid);

    assert_eq!(monitor.check().await, Verdict::Healthy);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(monitor.restarts(), 1);
    launcher.kill_all();
}

#[cfg(unix)]
#[tokio::test]
async fn hung_worker_is_terminated_before_restart() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    layout.ensure().unwrap();

    let mut hung = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let hung_pid = hung.id();
    let waiter = std::thread::spawn(move || hung.wait().unwrap());
    write_beat(
        &layout.heartbeat_file(),
        &beat(hung_pid, 3600, WorkerState::RunningCycle),
    );

    let launcher = FakeLauncher::new(layout.heartbeat_file());
    let mut monitor = monitor(&layout, &launcher);

    let verdict = monitor.check().await;
    assert!(matches!(verdict, Verdict::Stale { pid, .. } if pid == hung_pid));
    assert!(!waiter.join().unwrap().success());
    assert_eq!(launcher.launches(), 1);
    launcher.kill_all();
}

#[tokio::test]
async fn requested_worker_stop_is_not_undone() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    layout.ensure().unwrap();
    StopSignal::request(&layout.stop_marker("worker")).unwrap();

    let launcher = FakeLauncher::new(layout.heartbeat_file());
    let mut monitor = monitor(&layout, &launcher);

    assert_eq!(monitor.check().await, Verdict::Missing);
    assert_eq!(launcher.launches(), 0);
    assert!(!layout.heartbeat_file().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn run_exits_on_its_stop_marker() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    layout.ensure().unwrap();
    let launcher = FakeLauncher::new(layout.heartbeat_file());
    let mut monitor = monitor(&layout, &launcher);

    let marker = layout.stop_marker("monitor");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        StopSignal::request(&marker).unwrap();
    });
    let finished = tokio::time::timeout(Duration::from_secs(10), monitor.run()).await;

    assert!(finished.is_ok());
    assert_eq!(launcher.launches(), 1);
    launcher.kill_all();
}
