mod apply;
mod controller;
pub mod error;
mod store;
pub mod types;

pub use apply::{ApplyRecord, Applier};
pub use controller::PatchController;
pub use error::{PatchError, PatchResult};
pub use store::{FilePatchStore, MemoryPatchStore, PatchStore};
pub use types::{
    BranchRef, CheckKind, CheckResult, FileMap, PatchProposal, PatchStatus, ProposalId,
    StatusChange, ValidationReport, content_hash,
};

/// Edges of the proposal lifecycle. A status never transitions to itself,
/// and MERGED / REJECTED are terminal.
pub fn can_transition(from: PatchStatus, to: PatchStatus) -> bool {
    if from == to {
        return false;
    }
    match from {
        PatchStatus::Draft => matches!(to, PatchStatus::Validated | PatchStatus::Failed),
        PatchStatus::Validated | PatchStatus::Failed => matches!(to, PatchStatus::Proposed),
        PatchStatus::Proposed => matches!(to, PatchStatus::Approved | PatchStatus::Rejected),
        PatchStatus::Approved => matches!(to, PatchStatus::Merged),
        PatchStatus::Merged | PatchStatus::Rejected => false,
    }
}

#[cfg(test)]
mod tests;
