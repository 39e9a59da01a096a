mod collaborators;
mod cycle;
mod heartbeat;

pub use collaborators::{
    Collaborators, CommandCollaborator, DatasetSynthesizer, DirectoryIngestor, Evolver,
    GeneratedPatch, Ingestor, KnowledgeIndex, PatchGenerator, Trainer,
};
pub use cycle::{Phase, PhaseOutcome, PhaseRecord, WorkerCycle};
pub use heartbeat::{Heartbeat, HeartbeatWriter, WorkerState};

use anyhow::{Result, bail};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::atomic::append_json_line;
use crate::core::config::{DataLayout, WorkerConfig};
use crate::core::patch::{PatchController, PatchStatus};
use crate::platform::{NativePlatform, Platform};

const STOP_POLL: Duration = Duration::from_secs(1);
const SLEEP_BEAT_EVERY: u64 = 10;

/// Cooperative cancellation: a marker file other processes can create, plus
/// an in-process token (Ctrl+C). Polled between phases, never mid-phase.
#[derive(Clone)]
pub struct StopSignal {
    marker: PathBuf,
    token: CancellationToken,
}

impl StopSignal {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
            token: CancellationToken::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled() || self.marker.exists()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Ask the owning process to stop.
    pub fn request(marker: &Path) -> std::io::Result<()> {
        if let Some(dir) = marker.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(marker, Utc::now().to_rfc3339())
    }

    /// Remove a stale marker left by a previous stop.
    pub fn clear(&self) {
        if self.marker.exists()
            && let Err(e) = std::fs::remove_file(&self.marker)
        {
            warn!("Could not remove stop marker {}: {}", self.marker.display(), e);
        }
    }
}

/// Records this process's PID; refuses to start while a live process owns it.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn read(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let me = std::process::id();
        if let Some(pid) = Self::read(&path)
            && pid != me
            && NativePlatform::process_alive(pid)
        {
            bail!("Already running with PID {} ({})", pid, path.display());
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, me.to_string())?;
        NativePlatform::restrict_file_permissions(&path);
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if Self::read(&self.path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Quantities handed from one phase to the next within a cycle.
#[derive(Debug, Default)]
struct CycleContext {
    documents: usize,
    examples: usize,
}

/// Drives ingest -> vectorize -> synthesize -> train -> evolve -> patch
/// attempt, one cycle at a time, sleeping between cycles until stopped.
pub struct Worker {
    settings: WorkerConfig,
    controller: Arc<PatchController>,
    collaborators: Collaborators,
    stop: StopSignal,
    heartbeat: HeartbeatWriter,
    cycles_file: PathBuf,
    cycle_count: u64,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        layout: &DataLayout,
        settings: WorkerConfig,
        controller: Arc<PatchController>,
        collaborators: Collaborators,
        stop: StopSignal,
    ) -> Self {
        Self {
            settings,
            controller,
            collaborators,
            stop,
            heartbeat: HeartbeatWriter::new(layout.heartbeat_file()),
            cycles_file: layout.cycles_file(),
            cycle_count: 0,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn beat(&mut self, state: WorkerState, phase: Option<Phase>) {
        self.state = state;
        self.heartbeat.beat(state, phase, self.cycle_count);
    }

    /// Loop until the stop signal is observed. Returns normally on stop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Worker started (pid {}, interval {}s)",
            std::process::id(),
            self.settings.interval_secs
        );
        self.beat(WorkerState::Idle, None);

        while !self.stop.is_set() {
            let cycle = self.run_cycle().await;
            if cycle.stopped {
                break;
            }
            if !self.sleep_between_cycles().await {
                break;
            }
        }

        self.beat(WorkerState::Stopped, None);
        info!("Worker stopped after {} cycles", self.cycle_count);
        Ok(())
    }

    /// Sleep for the configured interval; `false` when a stop arrived.
    async fn sleep_between_cycles(&mut self) -> bool {
        self.beat(WorkerState::Sleeping, None);
        info!("Sleeping {}s until the next cycle", self.settings.interval_secs);
        let token = self.stop.token();
        for tick in 1..=self.settings.interval_secs.max(1) {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(STOP_POLL) => {}
            }
            if self.stop.is_set() {
                return false;
            }
            if tick % SLEEP_BEAT_EVERY == 0 {
                self.beat(WorkerState::Sleeping, None);
            }
        }
        true
    }

    /// One full cycle. Phase failures are recorded, never returned.
    pub async fn run_cycle(&mut self) -> WorkerCycle {
        self.cycle_count += 1;
        let mut cycle = WorkerCycle::begin(self.cycle_count);
        let mut ctx = CycleContext::default();
        info!("Cycle {} starting", cycle.number);

        for phase in Phase::ORDER {
            let started_at = Utc::now();
            if self.stop.is_set() {
                cycle.stopped = true;
                cycle.record(phase, PhaseOutcome::skipped("stop requested"), started_at);
                continue;
            }
            self.beat(WorkerState::RunningCycle, Some(phase));
            let outcome = self.run_phase(phase, &cycle, &mut ctx).await;
            match &outcome {
                PhaseOutcome::Completed { detail } => info!("Phase {} completed: {}", phase, detail),
                PhaseOutcome::Failed { error } => error!("Phase {} failed: {}", phase, error),
                PhaseOutcome::Skipped { reason } => info!("Phase {} skipped: {}", phase, reason),
                PhaseOutcome::DependencyFailed { dependency, reason } => {
                    warn!("Phase {} not run, {} unmet: {}", phase, dependency, reason)
                }
            }
            cycle.record(phase, outcome, started_at);
        }

        cycle.finish();
        if let Err(e) = append_json_line(&self.cycles_file, &cycle) {
            warn!("Could not record cycle {}: {}", cycle.number, e);
        }
        info!(
            "Cycle {} finished{}",
            cycle.number,
            cycle
                .error
                .as_deref()
                .map(|e| format!(" with error ({})", e))
                .unwrap_or_default()
        );
        cycle
    }

    /// Bound a collaborator call by the phase timeout.
    async fn bounded<T, F>(&self, phase: Phase, fut: F) -> Result<T, String>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.phase_timeout(), fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "{} timed out after {:?}",
                phase,
                self.settings.phase_timeout()
            )),
        }
    }

    /// `Some(outcome)` when `dependency` did not complete with usable output.
    fn require_documents(cycle: &WorkerCycle, ctx: &CycleContext) -> Option<PhaseOutcome> {
        if !cycle.outcome(Phase::Ingest).is_some_and(|o| o.is_completed()) {
            return Some(PhaseOutcome::DependencyFailed {
                dependency: Phase::Ingest,
                reason: "ingest did not complete".to_string(),
            });
        }
        if ctx.documents == 0 {
            return Some(PhaseOutcome::DependencyFailed {
                dependency: Phase::Ingest,
                reason: "no documents ingested".to_string(),
            });
        }
        None
    }

    fn require_examples(cycle: &WorkerCycle, ctx: &CycleContext, minimum: usize) -> Option<PhaseOutcome> {
        if !cycle.outcome(Phase::Synthesize).is_some_and(|o| o.is_completed()) {
            return Some(PhaseOutcome::DependencyFailed {
                dependency: Phase::Synthesize,
                reason: "no training data was synthesized".to_string(),
            });
        }
        if ctx.examples < minimum {
            return Some(PhaseOutcome::skipped(format!(
                "{} examples, need {}",
                ctx.examples, minimum
            )));
        }
        None
    }

    async fn run_phase(&self, phase: Phase, cycle: &WorkerCycle, ctx: &mut CycleContext) -> PhaseOutcome {
        let failed = |error: String| PhaseOutcome::Failed { error };
        match phase {
            Phase::Ingest => {
                let Some(ingestor) = &self.collaborators.ingestor else {
                    return PhaseOutcome::skipped("no ingestor configured");
                };
                match self.bounded(phase, ingestor.ingest()).await {
                    Ok(n) => {
                        ctx.documents = n;
                        PhaseOutcome::completed(format!("{} documents", n))
                    }
                    Err(e) => failed(e),
                }
            }
            Phase::Vectorize => {
                if let Some(unmet) = Self::require_documents(cycle, ctx) {
                    return unmet;
                }
                let Some(index) = &self.collaborators.index else {
                    return PhaseOutcome::skipped("no knowledge index configured");
                };
                match self.bounded(phase, index.rebuild(ctx.documents)).await {
                    Ok(n) => PhaseOutcome::completed(format!("{} entries indexed", n)),
                    Err(e) => failed(e),
                }
            }
            Phase::Synthesize => {
                if let Some(unmet) = Self::require_documents(cycle, ctx) {
                    return unmet;
                }
                let Some(synth) = &self.collaborators.synthesizer else {
                    return PhaseOutcome::skipped("no dataset synthesizer configured");
                };
                match self.bounded(phase, synth.synthesize(ctx.documents)).await {
                    Ok(n) => {
                        ctx.examples = n;
                        PhaseOutcome::completed(format!("{} examples", n))
                    }
                    Err(e) => failed(e),
                }
            }
            Phase::Train => {
                if let Some(unmet) =
                    Self::require_examples(cycle, ctx, self.settings.min_examples_for_training)
                {
                    return unmet;
                }
                let Some(trainer) = &self.collaborators.trainer else {
                    return PhaseOutcome::skipped("no trainer configured");
                };
                match self.bounded(phase, trainer.train(ctx.examples)).await {
                    Ok(detail) => PhaseOutcome::completed(detail),
                    Err(e) => failed(e),
                }
            }
            Phase::Evolve => {
                if !self.settings.evolution_enabled {
                    return PhaseOutcome::skipped("evolution disabled");
                }
                if let Some(unmet) =
                    Self::require_examples(cycle, ctx, self.settings.min_examples_for_evolution)
                {
                    return unmet;
                }
                let Some(evolver) = &self.collaborators.evolver else {
                    return PhaseOutcome::skipped("no evolver configured");
                };
                match self.bounded(phase, evolver.evolve(ctx.examples)).await {
                    Ok(detail) => PhaseOutcome::completed(detail),
                    Err(e) => failed(e),
                }
            }
            Phase::PatchAttempt => self.attempt_patch(cycle, ctx).await,
        }
    }

    async fn attempt_patch(&self, cycle: &WorkerCycle, ctx: &CycleContext) -> PhaseOutcome {
        if !self.settings.evolution_enabled {
            return PhaseOutcome::skipped("evolution disabled");
        }
        if let Some(unmet) = Self::require_examples(cycle, ctx, self.settings.min_examples_for_patch) {
            return unmet;
        }
        let Some(generator) = &self.collaborators.generator else {
            return PhaseOutcome::skipped("no patch generator configured");
        };
        match self.controller.list(Some(PatchStatus::Proposed)) {
            Ok(pending) if !pending.is_empty() => {
                return PhaseOutcome::skipped(format!("{} proposals awaiting review", pending.len()));
            }
            Ok(_) => {}
            Err(e) => return PhaseOutcome::Failed { error: e.to_string() },
        }

        let generated = match self.bounded(Phase::PatchAttempt, generator.generate()).await {
            Ok(Some(p)) => p,
            Ok(None) => return PhaseOutcome::completed("generator proposed nothing"),
            Err(e) => return PhaseOutcome::Failed { error: e },
        };
        if generated.files.len() > self.settings.max_patch_files {
            return PhaseOutcome::skipped(format!(
                "{} files exceeds max_patch_files {}",
                generated.files.len(),
                self.settings.max_patch_files
            ));
        }

        let title = if generated.title.trim().is_empty() {
            "Automated improvement".to_string()
        } else {
            generated.title
        };
        let submitted = self
            .controller
            .submit(&title, &generated.description, generated.files);
        match tokio::time::timeout(self.settings.phase_timeout(), submitted).await {
            Ok(Ok(p)) => PhaseOutcome::completed(format!("proposal {} is {}", p.id, p.status)),
            Ok(Err(e)) => PhaseOutcome::Failed { error: e.to_string() },
            Err(_) => PhaseOutcome::Failed {
                error: "proposal submission timed out".to_string(),
            },
        }
    }
}
