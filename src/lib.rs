//! commitctl: an appliance configuration commit engine.
//!
//! Settings live in flat tuning files (`name = value`). The first component
//! of every name selects the module that owns it. A commit parses the last
//! committed settings and the candidate settings, works out which modules
//! changed, and drives every module through
//! `init -> parse -> validate -> notify -> prepare -> commit`, committing
//! independent modules concurrently, level by level, in dependency order.
//!
//! # Architecture
//!
//! - [`core::registry`]: modules, their handlers and provides/requires edges,
//!   built by an explicit registration function.
//! - [`core::resolver`]: commit order and concurrency levels.
//! - [`core::settings`]: tuning-file parser and per-module change detection.
//! - [`core::pipeline`]: the commit state machine.
//! - [`core::snapshot`]: whole-appliance snapshot create/apply with revert.
//! - [`core::lock`]: cross-process commit lock.
//! - [`core::engine`]: one resolved engine per invocation; takes the lock.
//! - [`modules`]: built-in client modules.
//!
//! # Examples
//!
//! ```bash
//! # First commit of the installed settings
//! commitctl commit bootstrap
//!
//! # Check a candidate file, then commit only the hostname module
//! commitctl validate /tmp/new.tune
//! commitctl commit /tmp/new.tune hostname
//!
//! # Inspect the resolved order
//! commitctl --dump
//! ```
//!
//! The process exit status is `0` or `1`, OR'd with `0x10` when a reboot is
//! needed and `0x20` when the management interface must restart.

pub mod core;
pub mod modules;

mod cli;

use crate::cli::{Cli, Command};
use crate::core::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::error::CommitError;
use crate::core::logging::{self, Profile};
use crate::core::pipeline::{CommitRequest, PipelineReport};
use crate::core::status::{Outcome, RestartFlags};
use clap::Parser;
use colored::Colorize;
use std::path::Path;

pub fn run() -> Result<Outcome, CommitError> {
    let cli = Cli::parse();
    logging::init(Profile::from_format(&cli.log_format));

    let config = EngineConfig::load(cli.config.as_deref())?;
    let registry = modules::register_builtin(&config)?;
    let mut engine = Engine::new(registry, config)?;

    if cli.dump {
        print!("{}", engine.dump_order());
        return Ok(Outcome::ok());
    }
    if cli.dump_tuning {
        print!("{}", engine.dump_tuning());
        return Ok(Outcome::ok());
    }
    if let Some(settings) = &cli.test {
        let report = engine.run_pipeline(&CommitRequest::test(settings))?;
        print_report("test", &report);
        return Ok(report.outcome());
    }

    let Some(command) = cli.command else {
        return Err(CommitError::ValidationError(
            "no command given (see --help)".to_string(),
        ));
    };

    match command {
        Command::Commit { target, range } => {
            let request = if target == "bootstrap" {
                CommitRequest::bootstrap()
            } else {
                CommitRequest::commit(Path::new(&target))
            };
            let report = engine.run_pipeline(&request.with_range(range))?;
            print_report("commit", &report);
            Ok(report.outcome())
        }
        Command::Validate { settings } => {
            let report = engine.run_pipeline(&CommitRequest::validate(&settings))?;
            print_report("validate", &report);
            Ok(report.outcome())
        }
        Command::Merge { settings, modules } => {
            let report = engine.run_pipeline(&CommitRequest::merge(&settings, modules))?;
            print_report("merge", &report);
            Ok(report.outcome())
        }
        Command::Migrate {
            prev_version,
            prev_root,
        } => {
            let outcome = engine.migrate(&prev_version, &prev_root)?;
            print_outcome("migrate", &outcome);
            Ok(outcome)
        }
        Command::CreateSnapshot { archive, comment } => {
            let report = engine.create_snapshot(&archive, comment.as_deref())?;
            println!(
                "{} snapshot {} ({} entries)",
                "✓".bright_green(),
                report.archive.display(),
                report.entries
            );
            for warning in &report.warnings {
                println!("  {} {}", "!".bright_yellow(), warning);
            }
            Ok(Outcome::ok())
        }
        Command::ApplySnapshot { archive } => {
            let outcome = engine.apply_snapshot(&archive)?;
            print_outcome("apply_snapshot", &outcome);
            Ok(outcome)
        }
        Command::Trigger { event, args } => {
            let outcome = engine.trigger(&event, &args);
            print_outcome(&format!("trigger {}", event), &outcome);
            Ok(outcome)
        }
        Command::StopAllProcesses => {
            let outcome = engine.stop_all_processes();
            print_outcome("stop_all_processes", &outcome);
            Ok(outcome)
        }
    }
}

fn print_flags(flags: RestartFlags) {
    if flags.contains(RestartFlags::NEED_REBOOT) {
        println!("  {} reboot required", "!".bright_yellow());
    }
    if flags.contains(RestartFlags::NEED_LMI_RESTART) {
        println!("  {} management interface restart required", "!".bright_yellow());
    }
}

fn print_report(op: &str, report: &PipelineReport) {
    match report.failed_phase {
        None => {
            println!(
                "{} {}: {} modified, {} committed, {} skipped",
                "✓".bright_green(),
                op.bold(),
                report.modified.len(),
                report.committed.len(),
                report.skipped.len()
            );
            if !report.modified.is_empty() {
                println!("  modified: {}", report.modified.join(", "));
            }
        }
        Some(phase) => {
            println!(
                "{} {} failed during {}",
                "✗".bright_red(),
                op.bold(),
                phase.to_string().bright_red()
            );
            for error in &report.errors {
                println!("  {} {}", "-".bright_red(), error);
            }
        }
    }
    print_flags(report.flags);
}

fn print_outcome(op: &str, outcome: &Outcome) {
    if outcome.success {
        println!("{} {}", "✓".bright_green(), op.bold());
    } else {
        println!("{} {} failed", "✗".bright_red(), op.bold());
        for failure in &outcome.failures {
            println!("  {} {}", "-".bright_red(), failure);
        }
    }
    print_flags(outcome.flags);
}
