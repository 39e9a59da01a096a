mod controller;

use super::*;

pub(super) fn files(entries: &[(&str, &str)]) -> FileMap {
    entries
        .iter()
        .map(|(p, c)| (p.to_string(), c.to_string()))
        .collect()
}

pub(super) fn report_for(proposal: &PatchProposal, passed: bool) -> ValidationReport {
    let check = CheckResult::new(CheckKind::Syntax, Some("a.json"), passed, "fixture");
    ValidationReport::from_checks(proposal.content_hash.clone(), vec![check], chrono::Utc::now())
}
