//! Shared fixtures: a recording module handler and rooted engine configs.
#![allow(dead_code)]

use commitctl::core::config::EngineConfig;
use commitctl::core::error::HookResult;
use commitctl::core::logging::{self, Profile};
use commitctl::core::registry::{DryRun, ModuleHandler};
use commitctl::core::status::RestartFlags;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    logging::init(Profile::Quiet);
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log poisoned").clone()
}

pub fn count(log: &Log, entry: &str) -> usize {
    entries(log).iter().filter(|e| e.as_str() == entry).count()
}

pub fn position(log: &Log, entry: &str) -> usize {
    entries(log)
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("'{}' not in log {:?}", entry, entries(log)))
}

#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub validate: bool,
    pub prepare: bool,
    pub commit: bool,
    pub commit_flags: RestartFlags,
    pub snapshot_apply: bool,
    pub event: bool,
    /// Names with an empty dotted component fail validation.
    pub strict_names: bool,
}

/// Handler that records every callback as `module:hook[:detail]`.
pub struct Probe {
    name: String,
    log: Log,
    faults: Faults,
    bad_names: Vec<String>,
}

impl Probe {
    pub fn new(name: &str, log: &Log) -> Box<Self> {
        Self::with(name, log, Faults::default())
    }

    pub fn with(name: &str, log: &Log, faults: Faults) -> Box<Self> {
        Box::new(Self {
            name: name.to_string(),
            log: log.clone(),
            faults,
            bad_names: Vec::new(),
        })
    }

    fn push(&self, entry: String) {
        self.log.lock().expect("log poisoned").push(entry);
    }
}

impl ModuleHandler for Probe {
    fn init(&mut self) -> HookResult {
        self.push(format!("{}:init", self.name));
        Ok(())
    }

    fn parse(&mut self, name: &str, value: &str, new_pass: bool) -> HookResult {
        let pass = if new_pass { "new" } else { "current" };
        self.push(format!("{}:parse:{}={}:{}", self.name, name, value, pass));
        if self.faults.strict_names && name.split('.').any(str::is_empty) {
            self.bad_names.push(name.to_string());
        }
        Ok(())
    }

    fn validate(&mut self) -> HookResult {
        self.push(format!("{}:validate", self.name));
        if !self.bad_names.is_empty() {
            return Err(format!("malformed setting names: {}", self.bad_names.join(", ")));
        }
        if self.faults.validate {
            return Err("rejected".to_string());
        }
        Ok(())
    }

    fn prepare(&mut self, modified: bool, dry_run: DryRun) -> HookResult {
        self.push(format!("{}:prepare:{}:{:?}", self.name, modified, dry_run));
        if self.faults.prepare {
            return Err("prepare failed".to_string());
        }
        Ok(())
    }

    fn commit(&mut self, modified: bool) -> HookResult<RestartFlags> {
        self.push(format!("{}:commit:{}", self.name, modified));
        if self.faults.commit {
            return Err("commit failed".to_string());
        }
        Ok(self.faults.commit_flags)
    }

    fn observe_parse(
        &mut self,
        watched: &str,
        name: &str,
        _value: &str,
        new_pass: bool,
    ) -> HookResult {
        if new_pass {
            self.push(format!("{}:observe_parse:{}:{}", self.name, watched, name));
        }
        Ok(())
    }

    fn observe_modified(&mut self, watched: &str, modified: bool) -> HookResult {
        self.push(format!("{}:observe:{}:{}", self.name, watched, modified));
        Ok(())
    }

    fn snapshot_create(&mut self, workdir: &Path) -> HookResult {
        self.push(format!("{}:snapshot_create", self.name));
        fs::write(workdir.join(format!("probe-{}", self.name)), &self.name)
            .map_err(|e| e.to_string())
    }

    fn snapshot_apply(
        &mut self,
        _backup_dir: &Path,
        unpacked_dir: &Path,
    ) -> HookResult<RestartFlags> {
        self.push(format!("{}:snapshot_apply", self.name));
        if self.faults.snapshot_apply {
            return Err(format!("cannot apply from {}", unpacked_dir.display()));
        }
        Ok(self.faults.commit_flags)
    }

    fn snapshot_rollback(&mut self, _backup_dir: &Path) -> HookResult {
        self.push(format!("{}:rollback", self.name));
        Ok(())
    }

    fn pre_migrate(&mut self, prev_version: &str, _prev_root: &Path) -> HookResult {
        self.push(format!("{}:pre_migrate:{}", self.name, prev_version));
        Ok(())
    }

    fn post_migrate(&mut self, prev_version: &str, _prev_root: &Path) -> HookResult {
        self.push(format!("{}:post_migrate:{}", self.name, prev_version));
        Ok(())
    }

    fn on_event(&mut self, event: &str, args: &[String]) -> HookResult {
        self.push(format!("{}:event:{}:{}", self.name, event, args.join(",")));
        if self.faults.event {
            return Err("event failed".to_string());
        }
        Ok(())
    }

    fn shutdown(&mut self) -> HookResult {
        self.push(format!("{}:shutdown", self.name));
        Ok(())
    }
}

/// Commit blocks until `expected` handlers sharing the same gate are all
/// inside their commit, or fails after five seconds.
pub struct Rendezvous {
    gate: Arc<(Mutex<usize>, Condvar)>,
    expected: usize,
}

impl Rendezvous {
    pub fn gate() -> Arc<(Mutex<usize>, Condvar)> {
        Arc::new((Mutex::new(0), Condvar::new()))
    }

    pub fn new(gate: &Arc<(Mutex<usize>, Condvar)>, expected: usize) -> Box<Self> {
        Box::new(Self {
            gate: Arc::clone(gate),
            expected,
        })
    }
}

impl ModuleHandler for Rendezvous {
    fn commit(&mut self, _modified: bool) -> HookResult<RestartFlags> {
        let (arrived, all_in) = &*self.gate;
        let mut arrived = arrived.lock().expect("gate poisoned");
        *arrived += 1;
        all_in.notify_all();
        let (arrived, wait) = all_in
            .wait_timeout_while(arrived, Duration::from_secs(5), |n| *n < self.expected)
            .expect("gate poisoned");
        if wait.timed_out() {
            return Err(format!("committed alone ({} of {} arrived)", *arrived, self.expected));
        }
        Ok(RestartFlags::empty())
    }
}

/// Config with every path under `root` and a short lock timeout.
pub fn rooted(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::rooted_at(root);
    config.lock.timeout_secs = 1;
    config.lock.poll_interval_ms = 10;
    config.shutdown.timeout_secs = 5;
    config
}

pub fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
