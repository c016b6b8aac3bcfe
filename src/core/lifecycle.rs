//! Operations outside the commit pipeline: external events, process
//! shutdown and migration from a previous installation. Each one runs every
//! step it can and returns an aggregate outcome.

use crate::core::config::EngineConfig;
use crate::core::error::CommitError;
use crate::core::files;
use crate::core::journal::Journal;
use crate::core::patterns;
use crate::core::registry::Registry;
use crate::core::resolver::CommitPlan;
use crate::core::status::Outcome;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const STOP_POLL: Duration = Duration::from_millis(100);

fn record(journal: &Journal, op: &str, outcome: &Outcome) {
    let status = if outcome.success { "ok" } else { "failed" };
    let detail = outcome.failures.join("; ");
    journal.record(op, None, status, (!detail.is_empty()).then_some(detail.as_str()));
}

/// Deliver `event` to every subscribed module, in registration order.
pub fn trigger(
    registry: &mut Registry,
    config: &EngineConfig,
    event: &str,
    args: &[String],
) -> Outcome {
    let subscribers = registry.event_subscribers(event);
    if subscribers.is_empty() {
        tracing::info!(event, "no module subscribed to event");
    }
    let mut outcome = Outcome::ok();
    for module in subscribers {
        let Some(handler) = registry.handler_mut(&module) else {
            continue;
        };
        if let Err(e) = handler.on_event(event, args) {
            tracing::warn!(module = %module, event, error = %e, "event handler failed");
            outcome.merge(Outcome::failed(
                CommitError::module(&module, &format!("event '{}'", event), e).to_string(),
            ));
        }
    }
    record(&Journal::new(&config.paths.state_dir), "trigger", &outcome);
    outcome
}

/// Shutdown hooks in reverse commit order, then SIGTERM every process named
/// by a PID file and wait for them to exit.
pub fn stop_all_processes(
    registry: &mut Registry,
    plan: &CommitPlan,
    config: &EngineConfig,
) -> Outcome {
    let participants: BTreeMap<String, Vec<String>> = registry
        .shutdown_participants()
        .iter()
        .map(|(m, p)| (m.clone(), p.clone()))
        .collect();

    let mut outcome = Outcome::ok();
    let mut pid_patterns = Vec::new();
    for module in plan.order().iter().rev() {
        let Some(module_patterns) = participants.get(module) else {
            continue;
        };
        pid_patterns.extend(module_patterns.iter().cloned());
        if let Some(handler) = registry.handler_mut(module)
            && let Err(e) = handler.shutdown()
        {
            tracing::warn!(module = %module, error = %e, "shutdown hook failed");
            outcome.merge(Outcome::failed(CommitError::module(module, "shutdown", e).to_string()));
        }
    }
    pid_patterns.extend(config.shutdown.pid_files.iter().cloned());

    let mut pending = Vec::new();
    for pattern in &pid_patterns {
        let pid_files = match patterns::expand_under(&config.paths.module_root, pattern) {
            Ok(found) => found,
            Err(err) => {
                outcome.merge(Outcome::failed(err.to_string()));
                continue;
            }
        };
        for pid_file in pid_files {
            match signal_pid_file(&pid_file) {
                Ok(Some(pid)) => pending.push((pid, pid_file)),
                Ok(None) => {}
                Err(err) => outcome.merge(Outcome::failed(err.to_string())),
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(config.shutdown.timeout_secs);
    while !pending.is_empty() {
        pending.retain(|(pid, _)| process_alive(*pid));
        if pending.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(STOP_POLL);
    }
    for (pid, pid_file) in &pending {
        outcome.merge(Outcome::failed(format!(
            "process {} from {} still running after {}s",
            pid,
            pid_file.display(),
            config.shutdown.timeout_secs
        )));
    }

    record(&Journal::new(&config.paths.state_dir), "stop_all_processes", &outcome);
    outcome
}

/// Send SIGTERM to the PID recorded in `pid_file`. Returns the PID if a
/// live process was signalled.
fn signal_pid_file(pid_file: &Path) -> Result<Option<i32>, CommitError> {
    let raw = fs::read_to_string(pid_file)?;
    let pid: i32 = raw.trim().parse().map_err(|_| {
        CommitError::ValidationError(format!("{} does not hold a PID", pid_file.display()))
    })?;
    if pid <= 1 {
        return Err(CommitError::ValidationError(format!(
            "{} holds unusable PID {}",
            pid_file.display(),
            pid
        )));
    }
    match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {
            tracing::info!(pid, pid_file = %pid_file.display(), "sent SIGTERM");
            Ok(Some(pid))
        }
        Err(Errno::ESRCH) => Ok(None),
        Err(e) => Err(CommitError::ValidationError(format!(
            "cannot signal pid {} from {}: {}",
            pid,
            pid_file.display(),
            e
        ))),
    }
}

/// Pre-migrate hooks, copy registered file patterns from `prev_root` into
/// the live root, post-migrate hooks. Failures are collected, never fatal.
pub fn migrate(
    registry: &mut Registry,
    plan: &CommitPlan,
    config: &EngineConfig,
    prev_version: &str,
    prev_root: &Path,
) -> Outcome {
    let registered = registry.migrate_participants().to_vec();
    let participants: Vec<String> = plan
        .order()
        .iter()
        .filter(|m| registered.iter().any(|(r, _)| r == *m))
        .cloned()
        .collect();
    let mut outcome = Outcome::ok();

    for module in &participants {
        if let Some(handler) = registry.handler_mut(module)
            && let Err(e) = handler.pre_migrate(prev_version, prev_root)
        {
            let err = CommitError::module(module, "pre-migrate", e);
            outcome.merge(Outcome::failed(err.to_string()));
        }
    }

    let patterns: Vec<String> = registered
        .iter()
        .flat_map(|(_, p)| p.iter().cloned())
        .chain(config.migrate.patterns.iter().cloned())
        .collect();
    let mut copied = 0usize;
    for pattern in &patterns {
        match copy_pattern(prev_root, &config.paths.module_root, pattern) {
            Ok(n) => copied += n,
            Err(err) => {
                tracing::warn!(pattern = %pattern, error = %err, "migrate copy failed");
                outcome.merge(Outcome::failed(format!("{}: {}", pattern, err)));
            }
        }
    }
    tracing::info!(prev_version, copied, "migrated files from previous root");

    for module in &participants {
        if let Some(handler) = registry.handler_mut(module)
            && let Err(e) = handler.post_migrate(prev_version, prev_root)
        {
            let err = CommitError::module(module, "post-migrate", e);
            outcome.merge(Outcome::failed(err.to_string()));
        }
    }

    record(&Journal::new(&config.paths.state_dir), "migrate", &outcome);
    outcome
}

fn copy_pattern(from_root: &Path, to_root: &Path, pattern: &str) -> Result<usize, CommitError> {
    let mut copied = 0;
    for found in patterns::expand_under(from_root, pattern)? {
        for path in patterns::collect_tree(&found)? {
            let Ok(rel) = path.strip_prefix(from_root) else {
                continue;
            };
            let dst: PathBuf = to_root.join(rel);
            if files::copy_entry(&path, &dst)? {
                copied += 1;
            }
        }
    }
    Ok(copied)
}

fn process_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}
