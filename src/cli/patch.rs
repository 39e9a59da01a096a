use anyhow::{Context, Result, anyhow, bail};
use console::style;
use std::path::PathBuf;

use super::context::AppContext;
use crate::core::patch::{FileMap, PatchProposal, PatchStatus, ProposalId};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct SubmitArgs {
    pub title: String,
    pub description: String,
    /// (relative path inside the proposal, local file to read it from)
    pub files: Vec<(String, PathBuf)>,
}

pub(crate) fn parse_submit_args(args: &[String], start: usize) -> Result<SubmitArgs> {
    let mut parsed = SubmitArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--title" | "-t" => {
                if i + 1 < args.len() {
                    parsed.title = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--description" | "-d" => {
                if i + 1 < args.len() {
                    parsed.description = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--file" | "-f" => {
                let Some(spec) = args.get(i + 1) else {
                    bail!("--file needs a value of the form <relative>=<local path>");
                };
                let (rel, local) = match spec.split_once('=') {
                    Some((rel, local)) => (rel.to_string(), PathBuf::from(local)),
                    None => (spec.clone(), PathBuf::from(spec)),
                };
                if rel.is_empty() {
                    bail!("--file {} has an empty relative path", spec);
                }
                parsed.files.push((rel, local));
                i += 2;
            }
            _ => i += 1,
        }
    }
    if parsed.title.trim().is_empty() {
        bail!("--title is required");
    }
    if parsed.files.is_empty() {
        bail!("at least one --file is required");
    }
    Ok(parsed)
}

pub(crate) fn parse_status_filter(args: &[String], start: usize) -> Result<Option<PatchStatus>> {
    let mut i = start;
    while i < args.len() {
        if args[i] == "--status" || args[i] == "-s" {
            let raw = args
                .get(i + 1)
                .ok_or_else(|| anyhow!("--status needs a value"))?;
            return PatchStatus::from_status(raw)
                .map(Some)
                .ok_or_else(|| anyhow!("Unknown status '{}'", raw));
        }
        i += 1;
    }
    Ok(None)
}

fn proposal_id(args: &[String], index: usize) -> Result<ProposalId> {
    let raw = args
        .get(index)
        .ok_or_else(|| anyhow!("A proposal id is required"))?;
    ProposalId::parse(raw).ok_or_else(|| anyhow!("Invalid proposal id '{}'", raw))
}

fn styled_status(status: PatchStatus) -> String {
    let text = style(status.as_str()).bold();
    let styled = match status {
        PatchStatus::Merged | PatchStatus::Approved | PatchStatus::Validated => text.green(),
        PatchStatus::Failed | PatchStatus::Rejected => text.red(),
        PatchStatus::Proposed => text.yellow(),
        PatchStatus::Draft => text.dim(),
    };
    styled.to_string()
}

fn print_help() {
    GuideSection::new("autopatch patch")
        .command("list [--status <s>]", "List proposals, newest first")
        .command("show <id>", "Show a proposal with its validation report")
        .command("submit", "Create, validate and propose a patch")
        .command("approve <id>", "Approve a proposed patch")
        .command("reject <id>", "Reject a proposed patch")
        .command("merge <id>", "Apply an approved patch to the project")
        .blank()
        .hint(
            "autopatch patch submit --title \"Fix parser\" --file src/parser.py=./parser.py",
            "",
        )
        .print();
    println!();
}

pub async fn run_patch_command(ctx: &AppContext, args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    match sub_cmd {
        "list" | "ls" => list(ctx, parse_status_filter(args, 3)?).await,
        "show" => show(ctx, &proposal_id(args, 3)?).await,
        "submit" => submit(ctx, parse_submit_args(args, 3)?).await,
        "approve" => {
            let controller = ctx.controller().await?;
            let proposal = controller.approve(&proposal_id(args, 3)?)?;
            print_success(&format!("Proposal {} approved.", proposal.id));
            print_info(&format!(
                "Run {} to apply it.",
                style(format!("autopatch patch merge {}", proposal.id)).cyan()
            ));
            Ok(())
        }
        "reject" => {
            let controller = ctx.controller().await?;
            let proposal = controller.reject(&proposal_id(args, 3)?)?;
            print_warn(&format!("Proposal {} rejected.", proposal.id));
            Ok(())
        }
        "merge" => {
            let controller = ctx.controller().await?;
            let applier = ctx.applier()?;
            let proposal = controller.merge(&proposal_id(args, 3)?, &applier).await?;
            print_success(&format!(
                "Proposal {} merged into {} ({} files).",
                proposal.id,
                applier.project_root().display(),
                proposal.files.len()
            ));
            Ok(())
        }
        _ => {
            print_help();
            Ok(())
        }
    }
}

async fn list(ctx: &AppContext, status: Option<PatchStatus>) -> Result<()> {
    let controller = ctx.controller().await?;
    let proposals = controller.list(status)?;
    if proposals.is_empty() {
        print_info("No proposals.");
        return Ok(());
    }
    let mut section = GuideSection::new(&format!("Proposals ({})", proposals.len()));
    for p in &proposals {
        section = section.text(&format!(
            "{} {}  {:<10} {}  {}",
            p.status.glyph(),
            style(p.id.as_str()).bold(),
            styled_status(p.status),
            p.title,
            style(p.created_at.format("%Y-%m-%d %H:%M")).dim()
        ));
    }
    section.print();
    println!();
    Ok(())
}

async fn show(ctx: &AppContext, id: &ProposalId) -> Result<()> {
    let controller = ctx.controller().await?;
    let proposal = controller.get(id)?;
    print_proposal(&proposal);
    Ok(())
}

fn print_proposal(p: &PatchProposal) {
    let mut section = GuideSection::new(&format!("Proposal {}", p.id))
        .status("Title", &p.title)
        .status("Status", &format!("{} {}", p.status.glyph(), styled_status(p.status)))
        .status("Content", &style(&p.content_hash).dim().to_string())
        .status(
            "Branch",
            &p.branch_ref
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    if let Some(since) = p.merge_claim {
        section = section.status(
            "Merge",
            &style(format!("in progress since {}", since.format("%Y-%m-%d %H:%M:%S")))
                .yellow()
                .to_string(),
        );
    }
    if !p.description.is_empty() {
        section = section.blank().text(&p.description);
    }

    section = section.blank().text(&style("Files").bold().to_string());
    for (path, content) in &p.files {
        section = section.text(&format!("  {}  {}", path, style(format!("{} bytes", content.len())).dim()));
    }

    match &p.validation_report {
        Some(report) => {
            let verdict = if report.overall_passed {
                style("passed").green().bold()
            } else {
                style("failed").red().bold()
            };
            section = section
                .blank()
                .text(&format!("{} {}", style("Validation").bold(), verdict));
            for check in &report.checks {
                let mark = if check.skipped {
                    style("-").dim()
                } else if check.passed {
                    style("✓").green()
                } else if check.mandatory {
                    style("✗").red()
                } else {
                    style("!").yellow()
                };
                section = section.text(&format!("  {} {}  {}", mark, check.check_name, style(&check.message).dim()));
            }
            if let Some(dir) = &report.sandbox_dir {
                section = section.text(&format!("  sandbox kept at {}", dir.display()));
            }
        }
        None => section = section.blank().text("Not validated yet."),
    }

    if !p.history.is_empty() {
        section = section.blank().text(&style("History").bold().to_string());
        for change in &p.history {
            section = section.text(&format!(
                "  {}  {} -> {}",
                style(change.at.format("%Y-%m-%d %H:%M:%S")).dim(),
                change.from,
                change.to
            ));
        }
    }
    section.print();
    println!();
}

async fn submit(ctx: &AppContext, args: SubmitArgs) -> Result<()> {
    let mut files = FileMap::new();
    for (rel, local) in &args.files {
        let content = tokio::fs::read_to_string(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        files.insert(rel.clone(), content);
    }

    let controller = ctx.controller().await?;
    let proposal = controller.submit(&args.title, &args.description, files).await?;
    if proposal.validation_passed() {
        print_success(&format!("Proposal {} is {}.", proposal.id, proposal.status));
    } else {
        print_error(&format!(
            "Proposal {} failed validation and is {} for review.",
            proposal.id, proposal.status
        ));
    }
    print_proposal(&proposal);
    Ok(())
}
