use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingest,
    Vectorize,
    Synthesize,
    Train,
    Evolve,
    PatchAttempt,
}

impl Phase {
    /// Execution order within a cycle.
    pub const ORDER: [Phase; 6] = [
        Phase::Ingest,
        Phase::Vectorize,
        Phase::Synthesize,
        Phase::Train,
        Phase::Evolve,
        Phase::PatchAttempt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ingest => "ingest",
            Phase::Vectorize => "vectorize",
            Phase::Synthesize => "synthesize",
            Phase::Train => "train",
            Phase::Evolve => "evolve",
            Phase::PatchAttempt => "patch-attempt",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed { detail: String },
    Failed { error: String },
    Skipped { reason: String },
    /// A phase this one needs did not produce what it requires.
    DependencyFailed { dependency: Phase, reason: String },
}

impl PhaseOutcome {
    pub fn completed(detail: impl Into<String>) -> Self {
        PhaseOutcome::Completed {
            detail: detail.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        PhaseOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PhaseOutcome::Completed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PhaseOutcome::Completed { .. } => "completed",
            PhaseOutcome::Failed { .. } => "failed",
            PhaseOutcome::Skipped { .. } => "skipped",
            PhaseOutcome::DependencyFailed { .. } => "dependency-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    #[serde(flatten)]
    pub outcome: PhaseOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One pass through every phase, appended to `cycles.jsonl` when it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCycle {
    pub number: u64,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Last phase entered.
    pub phase: Option<Phase>,
    /// First phase failure, if any.
    pub error: Option<String>,
    #[serde(default)]
    pub stopped: bool,
    pub phases: Vec<PhaseRecord>,
}

impl WorkerCycle {
    pub fn begin(number: u64) -> Self {
        Self {
            number,
            pid: std::process::id(),
            started_at: Utc::now(),
            ended_at: None,
            phase: None,
            error: None,
            stopped: false,
            phases: Vec::new(),
        }
    }

    pub fn record(&mut self, phase: Phase, outcome: PhaseOutcome, started_at: DateTime<Utc>) {
        if let PhaseOutcome::Failed { error } = &outcome
            && self.error.is_none()
        {
            self.error = Some(format!("{}: {}", phase, error));
        }
        self.phase = Some(phase);
        self.phases.push(PhaseRecord {
            phase,
            outcome,
            started_at,
            ended_at: Utc::now(),
        });
    }

    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}
