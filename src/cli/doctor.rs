use anyhow::Result;

use super::context::AppContext;
use crate::core::isolation::detect_repository;
use crate::core::terminal::{print_error, print_info, print_step, print_success, print_warn};

/// `None` when the program cannot be started at all.
fn version_of(program: &str, args: &[&str]) -> Option<String> {
    let out = std::process::Command::new(program).args(args).output().ok()?;
    let text = if out.stdout.is_empty() { &out.stderr } else { &out.stdout };
    Some(
        String::from_utf8_lossy(text)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string(),
    )
}

/// The first argv entry of every configured check command.
fn configured_tools(ctx: &AppContext) -> Vec<String> {
    let sandbox = &ctx.config.sandbox;
    let mut tools: Vec<String> = [&sandbox.syntax, &sandbox.dependencies, &sandbox.lint, &sandbox.tests]
        .into_iter()
        .flat_map(|table| table.values())
        .filter_map(|argv| argv.first().cloned())
        .collect();
    tools.sort();
    tools.dedup();
    tools
}

pub async fn run_doctor(ctx: &AppContext) -> Result<()> {
    print_step("autopatch Doctor - Checking the environment...");
    println!();

    let mut problems = 0;

    match version_of("git", &["--version"]) {
        Some(v) => print_success(&format!("Git is available: {}", v)),
        None => {
            print_warn("Git is missing. Proposals will be materialized as plain directories.");
        }
    }

    let project_root = ctx.project_root()?;
    match detect_repository(&project_root).await {
        Some(repo) => print_success(&format!("Proposals branch off {}", repo.display())),
        None => print_info(&format!(
            "{} is not inside a git repository.",
            project_root.display()
        )),
    }

    for tool in configured_tools(ctx) {
        match version_of(&tool, &["--version"]) {
            Some(v) => print_success(&format!("{} is available: {}", tool, v)),
            None => {
                print_warn(&format!(
                    "{} is missing. Checks that use it will fail with 'failed to start'.",
                    tool
                ));
                problems += 1;
            }
        }
    }

    let marker = ctx.layout.run_dir().join(".doctor");
    match std::fs::write(&marker, b"ok").and_then(|_| std::fs::remove_file(&marker)) {
        Ok(()) => print_success(&format!(
            "Data directory is writable: {}",
            ctx.layout.root.display()
        )),
        Err(e) => {
            print_error(&format!(
                "Cannot write to {}: {}",
                ctx.layout.root.display(),
                e
            ));
            problems += 1;
        }
    }

    if ctx.config.governance.auto_approve {
        print_warn("auto_approve is on: passing proposals are approved without review.");
    }

    println!();
    if problems == 0 {
        print_success("Everything looks good.");
    } else {
        print_warn(&format!("{} problem(s) found.", problems));
    }
    Ok(())
}
