//! Module registry: the table of modules, their lifecycle handlers and the
//! state edges used to derive commit order.
//!
//! The registry is built explicitly by a registration function (see
//! [`crate::modules::register_builtin`]) and handed to the resolver. Name and
//! edge checks that depend on other registrations (unknown providers, unknown
//! observed modules) are deferred to [`Registry::match_observers`] and
//! [`crate::core::resolver::resolve`], since registration order is arbitrary.

use crate::core::error::{CommitError, HookResult};
use crate::core::status::RestartFlags;
use rustc_hash::FxHashMap;
use std::path::Path;

/// Anchor owning the reserved `sys.` settings prefix; commits before everything.
pub const SYS: &str = "sys";
/// Anchor every ordinary module commits after.
pub const FIRST: &str = "first";
/// Anchor every ordinary module commits before.
pub const LAST: &str = "last";
/// Anchor that commits after every `commit_last` module.
pub const DONE: &str = "done";

pub const ANCHORS: [&str; 4] = [SYS, FIRST, LAST, DONE];

pub fn is_anchor(name: &str) -> bool {
    ANCHORS.contains(&name)
}

/// Prepare-time simulation level handed to [`ModuleHandler::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DryRun {
    /// Real run: prepare for an upcoming commit.
    #[default]
    Off,
    /// `--test` run: nothing will be committed afterwards.
    Simulate,
}

/// Callbacks a module implements. Every method is optional.
///
/// Handlers are driven single-threaded in commit order for every phase
/// except commit, which runs one worker per module inside a level; hence the
/// `Send` bound.
pub trait ModuleHandler: Send {
    fn init(&mut self) -> HookResult {
        Ok(())
    }

    /// One `name = value` line owned by this module. `new_pass` is false while
    /// the last-committed settings are read and true for the candidate ones.
    fn parse(&mut self, _name: &str, _value: &str, _new_pass: bool) -> HookResult {
        Ok(())
    }

    fn validate(&mut self) -> HookResult {
        Ok(())
    }

    fn prepare(&mut self, _modified: bool, _dry_run: DryRun) -> HookResult {
        Ok(())
    }

    fn commit(&mut self, _modified: bool) -> HookResult<RestartFlags> {
        Ok(RestartFlags::empty())
    }

    /// A line owned by `watched`, delivered because this module observes it.
    fn observe_parse(
        &mut self,
        _watched: &str,
        _name: &str,
        _value: &str,
        _new_pass: bool,
    ) -> HookResult {
        Ok(())
    }

    /// Whether `watched` changed in this commit.
    fn observe_modified(&mut self, _watched: &str, _modified: bool) -> HookResult {
        Ok(())
    }

    /// Drop any module-specific files for a snapshot into `workdir`.
    fn snapshot_create(&mut self, _workdir: &Path) -> HookResult {
        Ok(())
    }

    fn snapshot_apply(
        &mut self,
        _backup_dir: &Path,
        _unpacked_dir: &Path,
    ) -> HookResult<RestartFlags> {
        Ok(RestartFlags::empty())
    }

    fn snapshot_rollback(&mut self, _backup_dir: &Path) -> HookResult {
        Ok(())
    }

    fn pre_migrate(&mut self, _prev_version: &str, _prev_root: &Path) -> HookResult {
        Ok(())
    }

    fn post_migrate(&mut self, _prev_version: &str, _prev_root: &Path) -> HookResult {
        Ok(())
    }

    fn on_event(&mut self, _event: &str, _args: &[String]) -> HookResult {
        Ok(())
    }

    fn shutdown(&mut self) -> HookResult {
        Ok(())
    }
}

/// Handler with no behaviour, used for the anchor modules.
pub struct NoopHandler;

impl ModuleHandler for NoopHandler {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleOptions {
    pub commit_first: bool,
    pub commit_last: bool,
    /// Skip prepare/commit while the appliance is in a security-error state.
    pub disable_on_security_error: bool,
}

impl ModuleOptions {
    pub fn first() -> Self {
        Self {
            commit_first: true,
            ..Self::default()
        }
    }

    pub fn last() -> Self {
        Self {
            commit_last: true,
            ..Self::default()
        }
    }
}

pub struct Module {
    pub name: String,
    pub options: ModuleOptions,
    pub(crate) handler: Box<dyn ModuleHandler>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub watcher: String,
    pub watched: String,
    pub parse: bool,
    pub modified: bool,
}

/// A setting a module declares for introspection (`--dump_tuning`).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Tuning {
    pub module: String,
    pub name: String,
    pub default: Option<String>,
    pub help: String,
}

#[derive(Default)]
pub struct Registry {
    modules: Vec<Module>,
    index: FxHashMap<String, usize>,
    provides: Vec<(String, String)>,
    requires: Vec<(String, String)>,
    observers: Vec<Observer>,
    events: Vec<(String, String)>,
    snapshot: Vec<String>,
    migrate: Vec<(String, Vec<String>)>,
    shutdown: Vec<(String, Vec<String>)>,
    tunings: Vec<Tuning>,
}

/// Module names: lowercase ASCII letters, digits and `_`, starting with a letter.
/// `-` is excluded because it separates the ends of a commit range.
pub fn is_valid_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// State names: uppercase ASCII letters, digits and `_`, starting with a letter.
pub fn is_valid_state_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn registration_error(message: String) -> CommitError {
    CommitError::RegistrationError(message)
}

impl Registry {
    /// Empty registry holding only the four anchor modules.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        for anchor in ANCHORS {
            registry.insert(anchor, ModuleOptions::default(), Box::new(NoopHandler));
        }
        registry
    }

    fn insert(&mut self, name: &str, options: ModuleOptions, handler: Box<dyn ModuleHandler>) {
        self.index.insert(name.to_string(), self.modules.len());
        self.modules.push(Module {
            name: name.to_string(),
            options,
            handler,
        });
    }

    pub fn register_module(
        &mut self,
        name: &str,
        options: ModuleOptions,
        handler: Box<dyn ModuleHandler>,
    ) -> Result<(), CommitError> {
        if !is_valid_module_name(name) {
            return Err(registration_error(format!(
                "invalid module name '{}' (lowercase letters, digits and '_' only)",
                name
            )));
        }
        if self.index.contains_key(name) {
            return Err(registration_error(format!("module '{}' registered twice", name)));
        }
        if options.commit_first && options.commit_last {
            return Err(registration_error(format!(
                "module '{}' cannot be both commit-first and commit-last",
                name
            )));
        }
        self.insert(name, options, handler);
        Ok(())
    }

    /// `module` provides the uppercase `state`.
    pub fn register_state(&mut self, module: &str, state: &str) -> Result<(), CommitError> {
        if !is_valid_module_name(module) {
            return Err(registration_error(format!(
                "invalid providing module name '{}'",
                module
            )));
        }
        if !is_valid_state_name(state) {
            return Err(registration_error(format!(
                "invalid state name '{}' (uppercase letters, digits and '_' only)",
                state
            )));
        }
        self.provides.push((module.to_string(), state.to_string()));
        Ok(())
    }

    /// `module` requires `state`, either an uppercase state or a module name
    /// (every module implicitly provides itself).
    pub fn register_requirement(&mut self, module: &str, state: &str) -> Result<(), CommitError> {
        if !is_valid_module_name(module) {
            return Err(registration_error(format!(
                "invalid requiring module name '{}'",
                module
            )));
        }
        if !is_valid_state_name(state) && !is_valid_module_name(state) {
            return Err(registration_error(format!(
                "invalid required state '{}' for module '{}'",
                state, module
            )));
        }
        self.requires.push((module.to_string(), state.to_string()));
        Ok(())
    }

    /// `watcher` additionally receives `watched`'s parse lines and/or its
    /// modified status.
    pub fn register_observer(
        &mut self,
        watcher: &str,
        watched: &str,
        parse: bool,
        modified: bool,
    ) -> Result<(), CommitError> {
        for name in [watcher, watched] {
            if !is_valid_module_name(name) {
                return Err(registration_error(format!(
                    "invalid module name '{}' in observer registration",
                    name
                )));
            }
        }
        if !parse && !modified {
            return Err(registration_error(format!(
                "observer '{}' of '{}' subscribes to nothing",
                watcher, watched
            )));
        }
        self.observers.push(Observer {
            watcher: watcher.to_string(),
            watched: watched.to_string(),
            parse,
            modified,
        });
        Ok(())
    }

    pub fn register_event(&mut self, module: &str, event: &str) -> Result<(), CommitError> {
        if event.trim().is_empty() {
            return Err(registration_error(format!(
                "module '{}' registered an empty event name",
                module
            )));
        }
        self.events.push((event.to_string(), module.to_string()));
        Ok(())
    }

    pub fn register_snapshot(&mut self, module: &str) -> Result<(), CommitError> {
        if !self.snapshot.iter().any(|m| m == module) {
            self.snapshot.push(module.to_string());
        }
        Ok(())
    }

    /// `module` runs migration hooks; `patterns` are absolute file globs copied
    /// from the previous root on migrate.
    pub fn register_migrate(&mut self, module: &str, patterns: &[&str]) -> Result<(), CommitError> {
        for pattern in patterns {
            if !pattern.starts_with('/') {
                return Err(registration_error(format!(
                    "migrate pattern '{}' of module '{}' must be absolute",
                    pattern, module
                )));
            }
        }
        self.migrate.push((
            module.to_string(),
            patterns.iter().map(|p| p.to_string()).collect(),
        ));
        Ok(())
    }

    /// `module` has a shutdown hook; `pid_files` are wildcard patterns naming
    /// PID files of processes to signal on `stop_all_processes`.
    pub fn register_shutdown(
        &mut self,
        module: &str,
        pid_files: &[&str],
    ) -> Result<(), CommitError> {
        self.shutdown.push((
            module.to_string(),
            pid_files.iter().map(|p| p.to_string()).collect(),
        ));
        Ok(())
    }

    pub fn register_tuning(
        &mut self,
        module: &str,
        name: &str,
        default: Option<&str>,
        help: &str,
    ) -> Result<(), CommitError> {
        let prefix = name.split('.').next().unwrap_or_default();
        if prefix != module {
            return Err(registration_error(format!(
                "tuning '{}' does not belong to module '{}'",
                name, module
            )));
        }
        self.tunings.push(Tuning {
            module: module.to_string(),
            name: name.to_string(),
            default: default.map(str::to_string),
            help: help.to_string(),
        });
        Ok(())
    }

    /// Check every deferred module reference now that registration is over.
    pub fn match_observers(&self) -> Result<(), CommitError> {
        for observer in &self.observers {
            for name in [&observer.watcher, &observer.watched] {
                if !self.contains(name) {
                    return Err(registration_error(format!(
                        "observer '{}' of '{}' references unknown module '{}'",
                        observer.watcher, observer.watched, name
                    )));
                }
            }
        }
        let hook_modules = self
            .events
            .iter()
            .map(|(_, m)| m)
            .chain(self.snapshot.iter())
            .chain(self.migrate.iter().map(|(m, _)| m))
            .chain(self.shutdown.iter().map(|(m, _)| m))
            .chain(self.tunings.iter().map(|t| &t.module));
        for module in hook_modules {
            if !self.contains(module) {
                return Err(registration_error(format!(
                    "hook registered for unknown module '{}'",
                    module
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub(crate) fn modules_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.modules.iter_mut()
    }

    pub(crate) fn handler_mut(&mut self, name: &str) -> Option<&mut Box<dyn ModuleHandler>> {
        let i = *self.index.get(name)?;
        Some(&mut self.modules[i].handler)
    }

    pub fn provides(&self) -> &[(String, String)] {
        &self.provides
    }

    pub fn requires(&self) -> &[(String, String)] {
        &self.requires
    }

    pub fn observers(&self) -> &[Observer] {
        &self.observers
    }

    /// Observers of `watched`, cloned so callers can borrow handlers mutably.
    pub(crate) fn observers_of(&self, watched: &str) -> Vec<Observer> {
        self.observers
            .iter()
            .filter(|o| o.watched == watched)
            .cloned()
            .collect()
    }

    /// Modules subscribed to `event`, in registration order.
    pub fn event_subscribers(&self, event: &str) -> Vec<String> {
        self.events
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn snapshot_participants(&self) -> &[String] {
        &self.snapshot
    }

    pub fn migrate_participants(&self) -> &[(String, Vec<String>)] {
        &self.migrate
    }

    pub fn shutdown_participants(&self) -> &[(String, Vec<String>)] {
        &self.shutdown
    }

    pub fn tunings(&self) -> &[Tuning] {
        &self.tunings
    }
}
