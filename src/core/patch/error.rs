use thiserror::Error;

use super::types::{PatchStatus, ProposalId};

/// Errors surfaced by the patch store, controller and isolator.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The requested status change is not an edge of the state machine.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ProposalId,
        from: PatchStatus,
        to: PatchStatus,
    },

    #[error("Proposal not found: {0}")]
    NotFound(ProposalId),

    /// A persisted record exists but cannot be parsed or is inconsistent.
    #[error("Corrupt proposal record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("A proposal must contain at least one file")]
    EmptyBundle,

    #[error("Unsafe path in bundle: {0}")]
    UnsafePath(String),

    /// File contents of an existing proposal may not change.
    #[error("Proposal {0} content is immutable")]
    ContentImmutable(ProposalId),

    #[error("Proposal {0} has no passing validation report")]
    ValidationRequired(ProposalId),

    /// Another caller holds the merge claim on this proposal.
    #[error("Proposal {0} is already being merged")]
    MergeInProgress(ProposalId),

    #[error("Apply rejected: {0}")]
    ApplyRejected(String),

    #[error("Version control error: {0}")]
    VersionControl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PatchResult<T> = Result<T, PatchError>;
