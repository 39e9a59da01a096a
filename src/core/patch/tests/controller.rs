use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Barrier};

use super::files;
use crate::core::config::{ApplyConfig, GovernanceConfig, SandboxConfig};
use crate::core::isolation::Isolator;
use crate::core::patch::{
    Applier, ApplyRecord, BranchRef, CheckKind, CheckResult, FileMap, FilePatchStore, MemoryPatchStore,
    PatchController, PatchError, PatchStatus, PatchStore, ProposalId, ValidationReport,
    content_hash,
};
use crate::core::sandbox::{SandboxRunner, Validator};

struct FixedVerdict(bool);

#[async_trait]
impl Validator for FixedVerdict {
    async fn validate(&self, files: &FileMap) -> ValidationReport {
        let check = CheckResult::new(CheckKind::Syntax, None, self.0, "fixed verdict");
        ValidationReport::from_checks(content_hash(files), vec![check], chrono::Utc::now())
    }
}

/// Passing verdict after a delay, so racing callers all start from DRAFT.
struct SlowVerdict(std::time::Duration);

#[async_trait]
impl Validator for SlowVerdict {
    async fn validate(&self, files: &FileMap) -> ValidationReport {
        tokio::time::sleep(self.0).await;
        FixedVerdict(true).validate(files).await
    }
}

fn controller(
    root: &Path,
    store: Arc<dyn PatchStore>,
    validator: Arc<dyn Validator>,
    auto_approve: bool,
) -> PatchController {
    let governance = GovernanceConfig {
        auto_approve,
        ..GovernanceConfig::default()
    };
    let isolator = Arc::new(Isolator::new(None, root.join("auto_edits"), &governance));
    PatchController::new(store, validator, isolator, governance)
}

fn memory_controller(root: &Path, passes: bool, auto_approve: bool) -> PatchController {
    controller(
        root,
        Arc::new(MemoryPatchStore::new()),
        Arc::new(FixedVerdict(passes)),
        auto_approve,
    )
}

fn bundle() -> FileMap {
    files(&[("src/app.py", "x = 1\n")])
}

#[tokio::test]
async fn passing_submission_is_proposed_and_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let c = memory_controller(dir.path(), true, false);

    let p = c.submit("ok", "passes", bundle()).await.unwrap();

    assert_eq!(p.status, PatchStatus::Proposed);
    assert!(p.validation_passed());
    let Some(BranchRef::Directory { path }) = &p.branch_ref else {
        panic!("expected directory ref, got {:?}", p.branch_ref);
    };
    assert!(path.join("src/app.py").exists());
    let trail: Vec<PatchStatus> = p.history.iter().map(|h| h.to).collect();
    assert_eq!(trail, vec![PatchStatus::Validated, PatchStatus::Proposed]);
}

#[tokio::test]
async fn auto_approve_applies_only_to_passing_proposals() {
    let dir = tempfile::tempdir().unwrap();
    let passing = memory_controller(dir.path(), true, true);
    let p = passing.submit("ok", "", bundle()).await.unwrap();
    assert_eq!(p.status, PatchStatus::Approved);

    let failing = memory_controller(dir.path(), false, true);
    let q = failing.submit("bad", "", bundle()).await.unwrap();
    assert_eq!(q.status, PatchStatus::Proposed);
    assert!(q.branch_ref.is_none());
}

#[tokio::test]
async fn structural_error_lands_in_proposed_via_failed() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = SandboxRunner::new(dir.path().join("sandbox"), SandboxConfig::builtin_only());
    let c = controller(
        dir.path(),
        Arc::new(MemoryPatchStore::new()),
        Arc::new(sandbox),
        true,
    );
    let bundle = files(&[
        ("config/good.json", "{\"retries\": 3}"),
        ("config/bad.json", "{\"retries\": "),
    ]);

    let p = c.submit("mixed", "", bundle).await.unwrap();

    let report = p.validation_report.as_ref().unwrap();
    assert!(!report.overall_passed);
    let flag = |name: &str| report.checks.iter().find(|c| c.check_name == name).unwrap().passed;
    assert!(flag("syntax:config/good.json"));
    assert!(!flag("syntax:config/bad.json"));
    let trail: Vec<PatchStatus> = p.history.iter().map(|h| h.to).collect();
    assert_eq!(trail, vec![PatchStatus::Failed, PatchStatus::Proposed]);
    assert_eq!(p.status, PatchStatus::Proposed);
}

#[tokio::test]
async fn escaping_path_fails_and_is_never_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = SandboxRunner::new(dir.path().join("sandbox"), SandboxConfig::builtin_only());
    let c = controller(
        dir.path(),
        Arc::new(MemoryPatchStore::new()),
        Arc::new(sandbox),
        true,
    );

    let p = c
        .submit("escape", "", files(&[("../../etc/evil.json", "{}")]))
        .await
        .unwrap();

    assert!(!p.validation_passed());
    assert!(p.branch_ref.is_none());
    assert!(matches!(
        c.materialize(&p.id).await,
        Err(PatchError::ValidationRequired(_))
    ));
    assert!(!dir.path().join("auto_edits").exists());
}

#[tokio::test]
async fn colliding_paths_are_recorded_as_a_failed_proposal() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = SandboxRunner::new(dir.path().join("sandbox"), SandboxConfig::builtin_only());
    let store = Arc::new(FilePatchStore::new(dir.path().join("patches")).unwrap());
    let c = controller(dir.path(), store, Arc::new(sandbox), true);

    let p = c
        .submit("conflict", "", files(&[("a", "x"), ("a/b.json", "{}")]))
        .await
        .unwrap();

    assert_eq!(p.status, PatchStatus::Proposed);
    assert!(!p.validation_passed());
    assert!(p.branch_ref.is_none());
    let stored = c.get(&p.id).unwrap();
    assert_eq!(stored.files.len(), 2);
    assert_eq!(stored.files["a/b.json"], "{}");
}

#[tokio::test]
async fn illegal_transitions_are_refused_and_change_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let c = memory_controller(dir.path(), true, false);
    let draft = c.create("t", "", bundle()).unwrap();

    assert!(matches!(
        c.approve(&draft.id),
        Err(PatchError::InvalidTransition { .. })
    ));
    assert!(matches!(
        c.propose(&draft.id),
        Err(PatchError::InvalidTransition { .. })
    ));
    assert_eq!(c.get(&draft.id).unwrap().status, PatchStatus::Draft);

    c.validate(&draft.id).await.unwrap();
    assert!(matches!(
        c.validate(&draft.id).await,
        Err(PatchError::InvalidTransition { .. })
    ));

    c.propose(&draft.id).unwrap();
    c.reject(&draft.id).unwrap();
    assert!(matches!(
        c.approve(&draft.id),
        Err(PatchError::InvalidTransition { .. })
    ));
    assert_eq!(c.get(&draft.id).unwrap().status, PatchStatus::Rejected);

    let unknown = ProposalId::from_raw("20000101_000000_000000_000000");
    assert!(matches!(c.approve(&unknown), Err(PatchError::NotFound(_))));
}

#[tokio::test]
async fn materialize_twice_returns_the_same_reference() {
    let dir = tempfile::tempdir().unwrap();
    let c = memory_controller(dir.path(), true, false);
    let p = c.create("t", "", bundle()).unwrap();
    c.validate(&p.id).await.unwrap();

    let first = c.materialize(&p.id).await.unwrap();
    let second = c.materialize(&p.id).await.unwrap();

    assert_eq!(first, second);
    let entries = std::fs::read_dir(dir.path().join("auto_edits"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn list_is_newest_first_and_filters_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let c = memory_controller(dir.path(), true, false);
    let first = c.create("first", "", bundle()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = c.submit("second", "", bundle()).await.unwrap();

    let all = c.list(None).unwrap();
    assert_eq!(all[0].id, second.id);
    assert_eq!(all[1].id, first.id);

    let drafts = c.list(Some(PatchStatus::Draft)).unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].id, first.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_approvals_have_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FilePatchStore::new(dir.path().join("patches")).unwrap());
    let c = controller(dir.path(), store, Arc::new(FixedVerdict(true)), false);

    for _ in 0..5 {
        let p = c.submit("race", "", bundle()).await.unwrap();
        assert_eq!(p.status, PatchStatus::Proposed);

        let barrier = Barrier::new(2);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        c.approve(&p.id)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(PatchError::InvalidTransition { .. })))
            .count();
        assert_eq!((wins, conflicts), (1, 1));

        let stored = c.get(&p.id).unwrap();
        assert_eq!(stored.status, PatchStatus::Approved);
        let approvals = stored
            .history
            .iter()
            .filter(|h| h.to == PatchStatus::Approved)
            .count();
        assert_eq!(approvals, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_validate_and_propose_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FilePatchStore::new(dir.path().join("patches")).unwrap());
    let slow = Arc::new(SlowVerdict(std::time::Duration::from_millis(200)));
    let c = Arc::new(controller(dir.path(), store, slow, false));
    let draft = c.create("race", "", bundle()).unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let c = Arc::clone(&c);
            let id = draft.id.clone();
            tokio::spawn(async move { c.validate_and_propose(&id).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let wins: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(wins.len(), 1);
    assert_eq!(wins[0].status, PatchStatus::Proposed);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(PatchError::InvalidTransition { .. }))));

    let stored = c.get(&draft.id).unwrap();
    assert_eq!(stored.status, PatchStatus::Proposed);
    let trail: Vec<PatchStatus> = stored.history.iter().map(|h| h.to).collect();
    assert_eq!(trail, vec![PatchStatus::Validated, PatchStatus::Proposed]);
    assert!(stored.validation_report.is_some());
    assert!(stored.branch_ref.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approve_and_reject_race_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FilePatchStore::new(dir.path().join("patches")).unwrap());
    let c = controller(dir.path(), store, Arc::new(FixedVerdict(true)), false);

    for _ in 0..5 {
        let p = c.submit("decide", "", bundle()).await.unwrap();
        let barrier = Barrier::new(2);
        let (approved, rejected) = std::thread::scope(|s| {
            let approve = s.spawn(|| {
                barrier.wait();
                c.approve(&p.id)
            });
            let reject = s.spawn(|| {
                barrier.wait();
                c.reject(&p.id)
            });
            (approve.join().unwrap(), reject.join().unwrap())
        });

        assert!(approved.is_ok() != rejected.is_ok());
        let loser = if approved.is_ok() { &rejected } else { &approved };
        assert!(matches!(loser, Err(PatchError::InvalidTransition { .. })));

        let stored = c.get(&p.id).unwrap();
        let expected = if approved.is_ok() {
            PatchStatus::Approved
        } else {
            PatchStatus::Rejected
        };
        assert_eq!(stored.status, expected);
        let decisions = stored
            .history
            .iter()
            .filter(|h| h.from == PatchStatus::Proposed)
            .count();
        assert_eq!(decisions, 1);
    }
}

#[tokio::test]
async fn merge_applies_approved_proposals_only() {
    let dir = tempfile::tempdir().unwrap();
    let c = memory_controller(dir.path(), true, false);
    let applier = Applier::new(
        dir.path().join("project"),
        dir.path().join("backups"),
        dir.path().join("apply_history.jsonl"),
        ApplyConfig::default(),
    );
    let p = c.submit("merge me", "", bundle()).await.unwrap();

    assert!(matches!(
        c.merge(&p.id, &applier).await,
        Err(PatchError::InvalidTransition { .. })
    ));
    assert!(!dir.path().join("project/src/app.py").exists());

    c.approve(&p.id).unwrap();
    let merged = c.merge(&p.id, &applier).await.unwrap();

    assert_eq!(merged.status, PatchStatus::Merged);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("project/src/app.py")).unwrap(),
        "x = 1\n"
    );
}

fn project_applier(root: &Path, postcheck: &[&str]) -> Applier {
    let config = ApplyConfig {
        postcheck_commands: postcheck.iter().map(|c| c.to_string()).collect(),
        ..ApplyConfig::default()
    };
    Applier::new(
        root.join("project"),
        root.join("backups"),
        root.join("apply_history.jsonl"),
        config,
    )
}

fn applied_records(root: &Path) -> usize {
    std::fs::read_to_string(root.join("apply_history.jsonl"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str::<ApplyRecord>(l).ok())
        .filter(|r| r.applied)
        .count()
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_merges_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FilePatchStore::new(dir.path().join("patches")).unwrap());
    let c = controller(dir.path(), store, Arc::new(FixedVerdict(true)), false);
    let applier = project_applier(dir.path(), &["sleep 0.3"]);
    let p = c.submit("race", "", bundle()).await.unwrap();
    c.approve(&p.id).unwrap();

    let (first, second) = tokio::join!(c.merge(&p.id, &applier), c.merge(&p.id, &applier));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(PatchError::MergeInProgress(_)) | Err(PatchError::InvalidTransition { .. })
    )));
    assert_eq!(applied_records(dir.path()), 1);
    let stored = c.get(&p.id).unwrap();
    assert_eq!(stored.status, PatchStatus::Merged);
    assert!(stored.merge_claim.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn rejected_apply_releases_the_merge_claim() {
    let dir = tempfile::tempdir().unwrap();
    let c = memory_controller(dir.path(), true, false);
    let applier = project_applier(dir.path(), &["exit 3"]);
    let p = c.submit("rollback", "", bundle()).await.unwrap();
    c.approve(&p.id).unwrap();

    assert!(matches!(
        c.merge(&p.id, &applier).await,
        Err(PatchError::ApplyRejected(_))
    ));
    let stored = c.get(&p.id).unwrap();
    assert_eq!(stored.status, PatchStatus::Approved);
    assert!(stored.merge_claim.is_none());

    let merged = c.merge(&p.id, &project_applier(dir.path(), &[])).await.unwrap();
    assert_eq!(merged.status, PatchStatus::Merged);
}

#[tokio::test]
async fn abandoned_merge_claims_are_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryPatchStore::new());
    let c = controller(dir.path(), store.clone(), Arc::new(FixedVerdict(true)), false);
    let applier = project_applier(dir.path(), &[]);
    let claim = |p: &ProposalId, age: chrono::Duration| {
        store
            .update(p, &mut |q| {
                q.merge_claim = Some(chrono::Utc::now() - age);
                Ok(())
            })
            .unwrap();
    };

    // A live claim blocks other merges.
    let live = c.submit("live", "", bundle()).await.unwrap();
    c.approve(&live.id).unwrap();
    claim(&live.id, chrono::Duration::zero());
    assert!(matches!(
        c.merge(&live.id, &applier).await,
        Err(PatchError::MergeInProgress(_))
    ));
    assert!(!dir.path().join("project/src/app.py").exists());

    // Crashed after applying: the history completes the merge without rewriting.
    let applied = c.submit("applied", "", bundle()).await.unwrap();
    c.approve(&applied.id).unwrap();
    claim(&applied.id, chrono::Duration::hours(1));
    let record = ApplyRecord {
        id: applied.id.clone(),
        applied: true,
        files: vec!["src/app.py".to_string()],
        backups: Default::default(),
        postcheck: Vec::new(),
        reason: None,
        at: chrono::Utc::now() - chrono::Duration::minutes(59),
    };
    crate::core::atomic::append_json_line(&dir.path().join("apply_history.jsonl"), &record)
        .unwrap();
    let merged = c.merge(&applied.id, &applier).await.unwrap();
    assert_eq!(merged.status, PatchStatus::Merged);
    assert!(merged.merge_claim.is_none());
    assert!(!dir.path().join("project/src/app.py").exists());

    // Crashed before recording anything: applied again.
    let lost = c.submit("lost", "", bundle()).await.unwrap();
    c.approve(&lost.id).unwrap();
    claim(&lost.id, chrono::Duration::hours(1));
    let merged = c.merge(&lost.id, &applier).await.unwrap();
    assert_eq!(merged.status, PatchStatus::Merged);
    assert!(dir.path().join("project/src/app.py").exists());
}

#[tokio::test]
async fn file_backed_controller_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let patches = dir.path().join("patches");
    let id = {
        let store = Arc::new(FilePatchStore::new(&patches).unwrap());
        let c = controller(dir.path(), store, Arc::new(FixedVerdict(true)), false);
        c.submit("durable", "", bundle()).await.unwrap().id
    };

    let store = Arc::new(FilePatchStore::new(&patches).unwrap());
    let c = controller(dir.path(), store, Arc::new(FixedVerdict(true)), false);
    let reopened = c.get(&id).unwrap();
    assert_eq!(reopened.status, PatchStatus::Proposed);
    assert!(reopened.branch_ref.is_some());
    assert_eq!(c.approve(&id).unwrap().status, PatchStatus::Approved);
}
