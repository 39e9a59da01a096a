mod context;
mod daemon;
mod doctor;
mod patch;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;
use context::AppContext;
use daemon::Daemon;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Proposals")
        .command("patch list", "List proposals (--status to filter)")
        .command("patch show <id>", "Show files, checks and history")
        .command("patch submit", "Validate and propose a set of files")
        .command("patch approve <id>", "Approve a proposed patch")
        .command("patch reject <id>", "Reject a proposed patch")
        .command("patch merge <id>", "Apply an approved patch")
        .print();

    GuideSection::new("Daemons")
        .command("worker run|once", "Run the cycle loop (or one cycle) in the foreground")
        .command("worker start|stop|status", "Manage the background worker")
        .command("monitor run", "Supervise the worker in the foreground")
        .command("monitor start|stop|status", "Manage the background monitor")
        .command("logs [worker|monitor]", "Follow a daemon log")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor", "Check tools used by the sandbox and isolator")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("autopatch").green()
    );
}

pub(crate) fn has_flag(args: &[String], start: usize, flag: &str) -> bool {
    args.iter().skip(start).any(|a| a == flag)
}

async fn run_daemon_command(ctx: &AppContext, which: Daemon, args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    let detached = has_flag(args, 3, "--detached");
    match (which, sub_cmd) {
        (Daemon::Worker, "run") => daemon::run_worker(ctx, false, detached).await,
        (Daemon::Worker, "once") => daemon::run_worker(ctx, true, false).await,
        (Daemon::Monitor, "run") => daemon::run_monitor(ctx, detached).await,
        (_, "start") => daemon::start(ctx, which).await,
        (_, "stop") => daemon::stop(ctx, which).await,
        (_, "status") => daemon::status(ctx, which).await,
        _ => {
            let expected = match which {
                Daemon::Worker => "run, once, start, stop, status",
                Daemon::Monitor => "run, start, stop, status",
            };
            print_error(&format!(
                "Unknown or missing {} command. Expected: {}",
                which.name(),
                expected
            ));
            Ok(())
        }
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "doctor" => {
            let ctx = AppContext::load().await?;
            logging::init_cli(&ctx.config.log_level);
            doctor::run_doctor(&ctx).await
        }
        "patch" => {
            let ctx = AppContext::load().await?;
            logging::init_cli(&ctx.config.log_level);
            patch::run_patch_command(&ctx, &args).await
        }
        "worker" => {
            let ctx = AppContext::load().await?;
            run_daemon_command(&ctx, Daemon::Worker, &args).await
        }
        "monitor" => {
            let ctx = AppContext::load().await?;
            run_daemon_command(&ctx, Daemon::Monitor, &args).await
        }
        "logs" => {
            let ctx = AppContext::load().await?;
            let name = match args.get(2).map(String::as_str) {
                None | Some("worker") => "worker",
                Some("monitor") => "monitor",
                Some(other) => {
                    print_error(&format!("Unknown log '{}'. Expected: worker, monitor", other));
                    return Ok(());
                }
            };
            daemon::follow_logs(&ctx, name).await
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
