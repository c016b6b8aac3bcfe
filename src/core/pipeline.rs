//! The commit pipeline.
//!
//! Phases run in strict sequence, each gating the next:
//! `Init -> ParseSystem -> ParseModules -> Validate -> Notify -> Prepare ->
//! Commit -> Finalize`. Every phase except Commit walks the total commit
//! order on one thread. Commit walks the levels; modules of one level commit
//! concurrently and the whole level is joined before its results are
//! inspected.

use crate::core::config::EngineConfig;
use crate::core::error::{CommitError, HookResult};
use crate::core::journal::Journal;
use crate::core::registry::{DryRun, Module, Registry};
use crate::core::resolver::{CommitPlan, CommitRange};
use crate::core::settings::{self, ChangeDetector, MissingFile, Pass, Section};
use crate::core::status::{Outcome, RestartFlags};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    ParseSystem,
    ParseModules,
    Validate,
    Notify,
    Prepare,
    Commit,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::ParseSystem => "parse-system",
            Phase::ParseModules => "parse-modules",
            Phase::Validate => "validate",
            Phase::Notify => "notify",
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Diff a candidate file against the committed one and commit it.
    Commit,
    /// First commit: the committed file is parsed once and everything is
    /// treated as modified.
    Bootstrap,
    /// Stop after Validate.
    ValidateOnly,
    /// Replace only the settings of the named modules with those of the
    /// candidate file, keep everything else as committed.
    Merge(BTreeSet<String>),
    /// Stop after a simulated Prepare.
    Test,
}

impl Mode {
    fn journal_op(&self) -> Option<&'static str> {
        match self {
            Mode::Commit => Some("commit"),
            Mode::Bootstrap => Some("bootstrap"),
            Mode::ValidateOnly => Some("validate"),
            Mode::Merge(_) => Some("merge"),
            Mode::Test => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub mode: Mode,
    /// Candidate settings file; unused for bootstrap.
    pub settings: Option<PathBuf>,
    /// `<module>` or `<module1>-<module2>`: only these modules commit.
    pub range: Option<String>,
}

impl CommitRequest {
    pub fn commit(settings: &Path) -> Self {
        Self {
            mode: Mode::Commit,
            settings: Some(settings.to_path_buf()),
            range: None,
        }
    }

    pub fn bootstrap() -> Self {
        Self {
            mode: Mode::Bootstrap,
            settings: None,
            range: None,
        }
    }

    pub fn validate(settings: &Path) -> Self {
        Self {
            mode: Mode::ValidateOnly,
            settings: Some(settings.to_path_buf()),
            range: None,
        }
    }

    pub fn merge<I, S>(settings: &Path, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: Mode::Merge(modules.into_iter().map(Into::into).collect()),
            settings: Some(settings.to_path_buf()),
            range: None,
        }
    }

    pub fn test(settings: &Path) -> Self {
        Self {
            mode: Mode::Test,
            settings: Some(settings.to_path_buf()),
            range: None,
        }
    }

    pub fn with_range(mut self, range: Option<String>) -> Self {
        self.range = range;
        self
    }
}

/// What one pipeline run did.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// First phase that failed, if any.
    pub failed_phase: Option<Phase>,
    pub errors: Vec<CommitError>,
    /// Modules whose settings changed (every module when bootstrapping).
    pub modified: Vec<String>,
    /// Modules whose commit callback ran, in commit order.
    pub committed: Vec<String>,
    /// Modules left out of Commit by the range or the security-error marker.
    pub skipped: Vec<String>,
    pub flags: RestartFlags,
    /// Whether the committed settings file was replaced.
    pub replaced_settings: bool,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.failed_phase.is_none()
    }

    pub fn failed_modules(&self) -> Vec<&str> {
        self.errors.iter().filter_map(CommitError::module_name).collect()
    }

    pub fn outcome(&self) -> Outcome {
        let mut outcome = Outcome::ok().with_flags(self.flags);
        outcome.success = self.success();
        outcome.failures = self.errors.iter().map(ToString::to_string).collect();
        outcome
    }

    fn fail(&mut self, phase: Phase, error: CommitError) {
        self.fail_many(phase, vec![error]);
    }

    fn fail_many(&mut self, phase: Phase, errors: Vec<CommitError>) {
        for error in &errors {
            tracing::error!(phase = %phase, error = %error, "phase failed");
        }
        self.failed_phase.get_or_insert(phase);
        self.errors.extend(errors);
    }
}

pub struct Pipeline<'a> {
    registry: &'a mut Registry,
    plan: &'a CommitPlan,
    config: &'a EngineConfig,
    journal: Journal,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a mut Registry, plan: &'a CommitPlan, config: &'a EngineConfig) -> Self {
        Self {
            registry,
            plan,
            config,
            journal: Journal::new(&config.paths.state_dir),
        }
    }

    /// Drive one request through the phases. Phase failures are reported in
    /// the returned report; `Err` is reserved for a malformed request.
    pub fn run(&mut self, request: &CommitRequest) -> Result<PipelineReport, CommitError> {
        let range = request
            .range
            .as_deref()
            .map(|spec| self.plan.range(spec))
            .transpose()?;
        let candidate = match (&request.mode, &request.settings) {
            (Mode::Bootstrap, _) => self.config.paths.committed_settings.clone(),
            (_, Some(path)) => path.clone(),
            (_, None) => {
                return Err(CommitError::ValidationError(
                    "no settings file given".to_string(),
                ));
            }
        };

        let mut report = PipelineReport::default();
        let hybrid = match &request.mode {
            Mode::Merge(modules) => match self.build_hybrid(&candidate, modules) {
                Ok(path) => Some(path),
                Err(err) => {
                    report.fail(Phase::ParseModules, err);
                    self.record(request, &report);
                    return Ok(report);
                }
            },
            _ => None,
        };
        let new_settings = hybrid.as_deref().unwrap_or(candidate.as_path());

        self.execute(request, range, new_settings, &mut report);

        if let Some(path) = hybrid {
            let _ = fs::remove_file(path);
        }
        self.record(request, &report);
        Ok(report)
    }

    fn execute(
        &mut self,
        request: &CommitRequest,
        range: Option<CommitRange>,
        new_settings: &Path,
        report: &mut PipelineReport,
    ) {
        let bootstrap = request.mode == Mode::Bootstrap;

        if let Err(err) = self.init() {
            report.fail(Phase::Init, err);
            return;
        }

        let mut detector = ChangeDetector::new(bootstrap);
        if let Err(err) = self.parse_system(&mut detector, bootstrap) {
            report.fail(Phase::ParseSystem, err);
            return;
        }
        if let Err(err) = self.parse_modules(&mut detector, bootstrap, new_settings) {
            report.fail(Phase::ParseModules, err);
            return;
        }

        let failures = self.validate();
        if !failures.is_empty() {
            report.fail_many(Phase::Validate, failures);
            if bootstrap {
                report.flags |= RestartFlags::NEED_REBOOT;
                self.mark_reboot("bootstrap validation failed");
            }
            return;
        }
        if request.mode == Mode::ValidateOnly {
            return;
        }

        let modified = match self.notify(&mut detector) {
            Ok(modified) => modified,
            Err(err) => {
                report.fail(Phase::Notify, err);
                return;
            }
        };
        report.modified = self
            .plan
            .order()
            .iter()
            .filter(|m| modified.get(*m).copied().unwrap_or(false))
            .cloned()
            .collect();

        let disabled = self.security_disabled();
        let dry_run = if request.mode == Mode::Test {
            DryRun::Simulate
        } else {
            DryRun::Off
        };
        if let Err(err) = self.prepare(&modified, &disabled, dry_run) {
            report.fail(Phase::Prepare, err);
            return;
        }
        if request.mode == Mode::Test {
            return;
        }

        let force_all = self.config.force_all_marker().exists();
        let range = if force_all {
            if range.is_some() {
                tracing::info!("force-commit-all marker present, ignoring commit range");
            }
            None
        } else {
            range
        };
        self.commit(&modified, &disabled, range, report);

        if report.success() {
            self.finalize(bootstrap, range.is_none(), new_settings, force_all, report);
        } else if !bootstrap {
            report.flags |= RestartFlags::NEED_REBOOT;
        }
        if report.flags.contains(RestartFlags::NEED_REBOOT) {
            self.mark_reboot("commit left the system needing a reboot");
        }
    }

    fn init(&mut self) -> Result<(), CommitError> {
        for name in self.plan.order() {
            if let Some(handler) = self.registry.handler_mut(name) {
                handler
                    .init()
                    .map_err(|e| CommitError::module(name, &Phase::Init.to_string(), e))?;
            }
        }
        Ok(())
    }

    fn parse_system(
        &mut self,
        detector: &mut ChangeDetector,
        bootstrap: bool,
    ) -> Result<(), CommitError> {
        let path = &self.config.paths.system_settings;
        if !bootstrap {
            settings::parse_file(
                self.registry,
                detector,
                path,
                Pass::Current,
                Section::System,
                MissingFile::Tolerate,
            )?;
        }
        settings::parse_file(
            self.registry,
            detector,
            path,
            Pass::New,
            Section::System,
            MissingFile::Tolerate,
        )?;
        Ok(())
    }

    fn parse_modules(
        &mut self,
        detector: &mut ChangeDetector,
        bootstrap: bool,
        new_settings: &Path,
    ) -> Result<(), CommitError> {
        if !bootstrap {
            settings::parse_file(
                self.registry,
                detector,
                &self.config.paths.committed_settings,
                Pass::Current,
                Section::Modules,
                MissingFile::Tolerate,
            )?;
        }
        let stats = settings::parse_file(
            self.registry,
            detector,
            new_settings,
            Pass::New,
            Section::Modules,
            MissingFile::Fail,
        )?;
        tracing::info!(
            path = %new_settings.display(),
            settings = stats.settings,
            skipped = stats.skipped,
            "parsed candidate settings"
        );
        Ok(())
    }

    /// Every module validates; all failures are returned together.
    fn validate(&mut self) -> Vec<CommitError> {
        let mut failures = Vec::new();
        let mut passed = 0usize;
        for name in self.plan.order() {
            let Some(handler) = self.registry.handler_mut(name) else {
                continue;
            };
            match handler.validate() {
                Ok(()) => passed += 1,
                Err(e) => {
                    tracing::warn!(module = %name, error = %e, "validation failed");
                    failures.push(CommitError::module(name, &Phase::Validate.to_string(), e));
                }
            }
        }
        tracing::info!(passed, failed = failures.len(), "validation finished");
        failures
    }

    fn notify(
        &mut self,
        detector: &mut ChangeDetector,
    ) -> Result<BTreeMap<String, bool>, CommitError> {
        detector.finalize(self.plan.order().iter().map(String::as_str));
        let modified: BTreeMap<String, bool> = self
            .plan
            .order()
            .iter()
            .map(|m| (m.clone(), detector.is_modified(m)))
            .collect();

        let observers: Vec<_> = self
            .registry
            .observers()
            .iter()
            .filter(|o| o.modified)
            .cloned()
            .collect();
        for observer in observers {
            let changed = modified.get(&observer.watched).copied().unwrap_or(false);
            if let Some(handler) = self.registry.handler_mut(&observer.watcher) {
                handler.observe_modified(&observer.watched, changed).map_err(|e| {
                    CommitError::module(&observer.watcher, &Phase::Notify.to_string(), e)
                })?;
            }
        }
        Ok(modified)
    }

    fn security_disabled(&self) -> BTreeSet<String> {
        if !self.config.security_error_marker().exists() {
            return BTreeSet::new();
        }
        let disabled: BTreeSet<String> = self
            .registry
            .modules()
            .filter(|m| m.options.disable_on_security_error)
            .map(|m| m.name.clone())
            .collect();
        if !disabled.is_empty() {
            tracing::warn!(modules = ?disabled, "security error state, modules disabled");
        }
        disabled
    }

    fn prepare(
        &mut self,
        modified: &BTreeMap<String, bool>,
        disabled: &BTreeSet<String>,
        dry_run: DryRun,
    ) -> Result<(), CommitError> {
        for name in self.plan.order() {
            if disabled.contains(name) {
                continue;
            }
            let changed = modified.get(name).copied().unwrap_or(false);
            if let Some(handler) = self.registry.handler_mut(name) {
                handler
                    .prepare(changed, dry_run)
                    .map_err(|e| CommitError::module(name, &Phase::Prepare.to_string(), e))?;
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        modified: &BTreeMap<String, bool>,
        disabled: &BTreeSet<String>,
        range: Option<CommitRange>,
        report: &mut PipelineReport,
    ) {
        for (level, names) in self.plan.levels().iter().enumerate() {
            let mut selected = BTreeSet::new();
            for name in names {
                let in_range = match (range, self.plan.position(name)) {
                    (None, _) => true,
                    (Some(range), Some(pos)) => range.contains(pos),
                    (Some(_), None) => false,
                };
                if in_range && !disabled.contains(name) {
                    selected.insert(name.as_str());
                } else {
                    report.skipped.push(name.clone());
                }
            }
            if selected.is_empty() {
                continue;
            }

            tracing::debug!(level, modules = selected.len(), "committing level");
            let mut workers: Vec<_> = self
                .registry
                .modules_mut()
                .filter(|m| selected.contains(m.name.as_str()))
                .collect();
            workers.sort_by_key(|m| self.plan.position(&m.name));
            let results = match ThreadPoolBuilder::new().num_threads(workers.len()).build() {
                Ok(pool) => pool.install(|| commit_level(workers, modified)),
                Err(err) => {
                    tracing::warn!(level, error = %err, "no level pool, using the shared one");
                    commit_level(workers, modified)
                }
            };

            let mut failures = Vec::new();
            for (name, result) in results {
                match result {
                    Ok(flags) => {
                        report.flags |= flags;
                        report.committed.push(name);
                    }
                    Err(e) => {
                        failures.push(CommitError::module(&name, &Phase::Commit.to_string(), e))
                    }
                }
            }
            if !failures.is_empty() {
                tracing::error!(level, "commit failed, remaining levels aborted");
                report.fail_many(Phase::Commit, failures);
                return;
            }
        }
    }

    fn finalize(
        &mut self,
        bootstrap: bool,
        whole_order: bool,
        new_settings: &Path,
        force_all: bool,
        report: &mut PipelineReport,
    ) {
        if !bootstrap && whole_order {
            match self.replace_committed(new_settings) {
                Ok(()) => report.replaced_settings = true,
                Err(err) => {
                    report.fail(Phase::Finalize, err);
                    report.flags |= RestartFlags::NEED_REBOOT;
                    return;
                }
            }
        }
        if force_all {
            let _ = fs::remove_file(self.config.force_all_marker());
        }
    }

    /// Copy next to the target, then rename over it.
    fn replace_committed(&self, source: &Path) -> Result<(), CommitError> {
        let target = &self.config.paths.committed_settings;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = target.with_extension(format!("tmp-{}", Ulid::new()));
        fs::copy(source, &tmp)?;
        fs::File::open(&tmp)?.sync_all()?;
        if let Err(err) = fs::rename(&tmp, target) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        tracing::info!(path = %target.display(), "committed settings replaced");
        Ok(())
    }

    fn build_hybrid(
        &self,
        replacement: &Path,
        modules: &BTreeSet<String>,
    ) -> Result<PathBuf, CommitError> {
        fs::create_dir_all(&self.config.paths.state_dir)?;
        let path = self
            .config
            .paths
            .state_dir
            .join(format!("merge-{}.tune", Ulid::new()));
        let mut sink = BufWriter::new(fs::File::create(&path)?);
        let written = settings::merge_settings(
            self.registry,
            &self.config.paths.committed_settings,
            replacement,
            modules,
            &mut sink,
        )
        .and_then(|n| {
            sink.flush()?;
            Ok(n)
        });
        drop(sink);
        match written {
            Ok(n) => {
                tracing::info!(lines = n, modules = ?modules, "merged settings");
                Ok(path)
            }
            Err(err) => {
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    fn mark_reboot(&self, reason: &str) {
        if let Err(err) = self.config.mark_reboot_required(reason) {
            tracing::warn!(error = %err, "could not write reboot marker");
        }
    }

    fn record(&self, request: &CommitRequest, report: &PipelineReport) {
        let Some(op) = request.mode.journal_op() else {
            return;
        };
        for error in &report.errors {
            self.journal
                .record(op, error.module_name(), "failed", Some(&error.to_string()));
        }
        let status = if report.success() { "ok" } else { "failed" };
        let detail = format!(
            "modified={} committed={} skipped={} flags={:#04x}",
            report.modified.len(),
            report.committed.len(),
            report.skipped.len(),
            report.flags.bits()
        );
        self.journal.record(op, None, status, Some(&detail));
    }
}

/// One worker per module; results come back in `workers` order.
fn commit_level(
    workers: Vec<&mut Module>,
    modified: &BTreeMap<String, bool>,
) -> Vec<(String, HookResult<RestartFlags>)> {
    workers
        .into_par_iter()
        .with_max_len(1)
        .map(|module| {
            let changed = modified.get(&module.name).copied().unwrap_or(false);
            (module.name.clone(), module.handler.commit(changed))
        })
        .collect()
}
