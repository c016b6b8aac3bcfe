//! Append-only JSONL journal of engine operations.
//!
//! One line per operation outcome in `<state_dir>/commit.events.jsonl`.
//! Journal failures are logged and never fail the operation being recorded.

use crate::core::error::CommitError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use ulid::Ulid;

pub const JOURNAL_FILE: &str = "commit.events.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JournalEvent {
    pub ts: String,
    pub event_id: String,
    pub op: String,
    pub module: Option<String>,
    pub status: String,
    pub detail: Option<String>,
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, op: &str, module: Option<&str>, status: &str, detail: Option<&str>) {
        let event = JournalEvent {
            ts: now_epoch_z(),
            event_id: Ulid::new().to_string(),
            op: op.to_string(),
            module: module.map(str::to_string),
            status: status.to_string(),
            detail: detail.map(str::to_string),
        };
        if let Err(err) = self.append(&event) {
            tracing::warn!(path = %self.path.display(), error = %err, "journal write failed");
        }
    }

    fn append(&self, event: &JournalEvent) -> Result<(), CommitError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    /// All events, oldest first. A missing journal is empty.
    pub fn read_all(&self) -> Result<Vec<JournalEvent>, CommitError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CommitError::IoError(e)),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_epoch_z_format() {
        let result = now_epoch_z();
        assert!(result.ends_with('Z'));
        assert!(result.trim_end_matches('Z').parse::<u64>().is_ok());
    }
}
