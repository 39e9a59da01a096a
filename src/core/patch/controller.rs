use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::apply::Applier;
use super::error::{PatchError, PatchResult};
use super::store::PatchStore;
use super::types::{BranchRef, FileMap, PatchProposal, PatchStatus, ProposalId};
use crate::core::config::GovernanceConfig;
use crate::core::isolation::Isolator;
use crate::core::sandbox::Validator;

/// Owns every status change of a proposal. All mutations go through
/// [`PatchStore::update`], so concurrent callers on one id serialize and
/// exactly one of them wins each transition.
pub struct PatchController {
    store: Arc<dyn PatchStore>,
    validator: Arc<dyn Validator>,
    isolator: Arc<Isolator>,
    governance: GovernanceConfig,
}

impl PatchController {
    pub fn new(
        store: Arc<dyn PatchStore>,
        validator: Arc<dyn Validator>,
        isolator: Arc<Isolator>,
        governance: GovernanceConfig,
    ) -> Self {
        Self {
            store,
            validator,
            isolator,
            governance,
        }
    }

    pub fn create(&self, title: &str, description: &str, files: FileMap) -> PatchResult<PatchProposal> {
        let proposal = PatchProposal::new(title, description, files)?;
        self.store.put(&proposal)?;
        info!(
            "Created proposal {} ({} files): {}",
            proposal.id,
            proposal.files.len(),
            proposal.title
        );
        Ok(proposal)
    }

    pub fn get(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        self.store.get(id)
    }

    /// Newest first.
    pub fn list(&self, status: Option<PatchStatus>) -> PatchResult<Vec<PatchProposal>> {
        let mut proposals: Vec<PatchProposal> = self
            .store
            .list()?
            .into_iter()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .collect();
        proposals.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(proposals)
    }

    fn transition(&self, id: &ProposalId, to: PatchStatus) -> PatchResult<PatchProposal> {
        let result = self.store.update(id, &mut |p| p.transition(to));
        match &result {
            Ok(p) => info!("Proposal {} is now {}", p.id, p.status),
            Err(e @ PatchError::InvalidTransition { .. }) => warn!("{}", e),
            Err(_) => {}
        }
        result
    }

    /// Run the sandbox on a DRAFT and record the verdict (VALIDATED or FAILED).
    pub async fn validate(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        let proposal = self.store.get(id)?;
        if proposal.status != PatchStatus::Draft || proposal.validation_report.is_some() {
            let err = PatchError::InvalidTransition {
                id: id.clone(),
                from: proposal.status,
                to: PatchStatus::Validated,
            };
            warn!("{}", err);
            return Err(err);
        }

        let report = self.validator.validate(&proposal.files).await;
        let verdict = if report.overall_passed {
            PatchStatus::Validated
        } else {
            PatchStatus::Failed
        };
        for check in report.failed_checks() {
            info!("{}: {} failed: {}", id, check.check_name, check.message);
        }

        let mut pending = Some(report);
        let result = self.store.update(id, &mut |p| {
            let report = pending.take().ok_or_else(|| PatchError::Corrupt {
                id: p.id.to_string(),
                reason: "validation report already consumed".to_string(),
            })?;
            p.attach_report(report)?;
            p.transition(verdict)
        });
        match &result {
            Ok(p) => info!("Proposal {} is now {}", p.id, p.status),
            Err(e) => warn!("Could not record validation for {}: {}", id, e),
        }
        result
    }

    pub fn propose(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        self.transition(id, PatchStatus::Proposed)
    }

    /// Record the proposal's files on an isolated branch or directory.
    /// Returns the existing reference when already materialized.
    pub async fn materialize(&self, id: &ProposalId) -> PatchResult<BranchRef> {
        let proposal = self.store.get(id)?;
        if let Some(existing) = proposal.branch_ref {
            return Ok(existing);
        }
        if !proposal.validation_passed() {
            return Err(PatchError::ValidationRequired(id.clone()));
        }

        let branch_ref = self.isolator.materialize(&proposal).await?;
        let mut fresh = Some(branch_ref);
        let updated = self.store.update(id, &mut |p| {
            if p.branch_ref.is_none() {
                p.branch_ref = fresh.take();
            }
            Ok(())
        })?;
        updated
            .branch_ref
            .ok_or_else(|| PatchError::VersionControl(format!("{} lost its branch reference", id)))
    }

    /// DRAFT -> VALIDATED|FAILED -> PROPOSED, then materialize when validation
    /// passed and, under the auto-approve policy, approve. A proposal already
    /// past validation resumes at the propose step.
    pub async fn validate_and_propose(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        let current = self.store.get(id)?;
        match current.status {
            PatchStatus::Draft => {
                self.validate(id).await?;
            }
            PatchStatus::Validated | PatchStatus::Failed => {}
            other => {
                return Err(PatchError::InvalidTransition {
                    id: id.clone(),
                    from: other,
                    to: PatchStatus::Proposed,
                });
            }
        }

        let proposed = self.propose(id)?;
        if !proposed.validation_passed() {
            info!("Proposal {} failed validation and awaits manual review", id);
            return Ok(proposed);
        }

        if let Err(e) = self.materialize(id).await {
            warn!("Materialization of {} failed: {}", id, e);
        }

        if self.governance.auto_approve {
            match self.approve(id) {
                Ok(p) => return Ok(p),
                // Someone else decided first; report what is stored.
                Err(PatchError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.store.get(id)
    }

    pub fn approve(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        self.transition(id, PatchStatus::Approved)
    }

    pub fn reject(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        self.transition(id, PatchStatus::Rejected)
    }

    /// Apply an APPROVED proposal to the project tree, then mark it MERGED.
    ///
    /// The proposal is claimed under its store lock before any file is
    /// written, so one caller applies and the others get `MergeInProgress`.
    /// A rolled-back apply releases the claim and leaves it APPROVED. A claim
    /// older than [`Applier::merge_window`] was left by a crashed merge: it is
    /// completed from the apply history, or applied again.
    pub async fn merge(&self, id: &ProposalId, applier: &Applier) -> PatchResult<PatchProposal> {
        let claimed_at = Utc::now();
        let window = applier.merge_window();
        let mut abandoned = None;
        let claimed = self.store.update(id, &mut |p| {
            if p.status != PatchStatus::Approved {
                return Err(PatchError::InvalidTransition {
                    id: p.id.clone(),
                    from: p.status,
                    to: PatchStatus::Merged,
                });
            }
            if !p.validation_passed() {
                return Err(PatchError::ValidationRequired(p.id.clone()));
            }
            if let Some(since) = p.merge_claim {
                let age = (claimed_at - since).to_std().unwrap_or_default();
                if age < window {
                    return Err(PatchError::MergeInProgress(p.id.clone()));
                }
                abandoned = Some(since);
            }
            p.merge_claim = Some(claimed_at);
            Ok(())
        });
        let proposal = match claimed {
            Ok(p) => p,
            Err(e) => {
                warn!("Cannot merge {}: {}", id, e);
                return Err(e);
            }
        };

        if let Some(since) = abandoned {
            warn!("Recovering merge of {} claimed at {}", id, since);
            if applier.applied_since(id, since) {
                return self.finish_merge(id);
            }
        }

        match applier.apply(&proposal).await {
            Ok(_) => self.finish_merge(id),
            Err(e) => {
                if let Err(release) = self.store.update(id, &mut |p| {
                    p.merge_claim = None;
                    Ok(())
                }) {
                    warn!("Could not release merge claim on {}: {}", id, release);
                }
                Err(e)
            }
        }
    }

    fn finish_merge(&self, id: &ProposalId) -> PatchResult<PatchProposal> {
        let result = self.store.update(id, &mut |p| {
            p.transition(PatchStatus::Merged)?;
            p.merge_claim = None;
            Ok(())
        });
        match &result {
            Ok(p) => info!("Proposal {} is now {}", p.id, p.status),
            Err(e) => warn!("Could not record merge of {}: {}", id, e),
        }
        result
    }

    /// `create` followed by `validate_and_propose`.
    pub async fn submit(&self, title: &str, description: &str, files: FileMap) -> PatchResult<PatchProposal> {
        let proposal = self.create(title, description, files)?;
        self.validate_and_propose(&proposal.id).await
    }
}
