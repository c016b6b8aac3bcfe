//! One resolved engine per process invocation.
//!
//! `Engine` owns the registry, the commit plan and the configuration, and is
//! where the cross-process commit lock is taken: every operation that
//! mutates the system holds it for its full duration, read-only operations
//! (`validate`, `--test`, dumps) never touch it.

use crate::core::config::EngineConfig;
use crate::core::error::CommitError;
use crate::core::lifecycle;
use crate::core::lock::CommitLock;
use crate::core::pipeline::{CommitRequest, Mode, Pipeline, PipelineReport};
use crate::core::registry::{Registry, Tuning};
use crate::core::resolver::{self, CommitPlan};
use crate::core::settings;
use crate::core::snapshot::{CreateReport, SnapshotManager};
use crate::core::status::Outcome;
use std::fmt::Write as _;
use std::path::Path;

pub struct Engine {
    registry: Registry,
    plan: CommitPlan,
    config: EngineConfig,
}

impl Engine {
    /// Check deferred registrations and resolve the commit order.
    pub fn new(registry: Registry, config: EngineConfig) -> Result<Self, CommitError> {
        registry.match_observers()?;
        let plan = resolver::resolve(&registry)?;
        Ok(Self {
            registry,
            plan,
            config,
        })
    }

    pub fn plan(&self) -> &CommitPlan {
        &self.plan
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> Result<CommitLock, CommitError> {
        CommitLock::acquire(&self.config.paths.lock_file, &self.config.lock)
    }

    pub fn run_pipeline(&mut self, request: &CommitRequest) -> Result<PipelineReport, CommitError> {
        let _lock = match request.mode {
            Mode::ValidateOnly | Mode::Test => None,
            _ => Some(self.lock()?),
        };
        Pipeline::new(&mut self.registry, &self.plan, &self.config).run(request)
    }

    pub fn create_snapshot(
        &mut self,
        archive: &Path,
        comment: Option<&Path>,
    ) -> Result<CreateReport, CommitError> {
        let _lock = self.lock()?;
        SnapshotManager::new(&mut self.registry, &self.plan, &self.config).create(archive, comment)
    }

    pub fn apply_snapshot(&mut self, archive: &Path) -> Result<Outcome, CommitError> {
        let _lock = self.lock()?;
        SnapshotManager::new(&mut self.registry, &self.plan, &self.config).apply(archive)
    }

    pub fn migrate(
        &mut self,
        prev_version: &str,
        prev_root: &Path,
    ) -> Result<Outcome, CommitError> {
        if !prev_root.is_dir() {
            return Err(CommitError::NotFound(format!(
                "previous root {}",
                prev_root.display()
            )));
        }
        let _lock = self.lock()?;
        Ok(lifecycle::migrate(
            &mut self.registry,
            &self.plan,
            &self.config,
            prev_version,
            prev_root,
        ))
    }

    pub fn trigger(&mut self, event: &str, args: &[String]) -> Outcome {
        lifecycle::trigger(&mut self.registry, &self.config, event, args)
    }

    pub fn stop_all_processes(&mut self) -> Outcome {
        lifecycle::stop_all_processes(&mut self.registry, &self.plan, &self.config)
    }

    /// Commit order, one module per line: position, level, name.
    pub fn dump_order(&self) -> String {
        let mut out = String::new();
        for (pos, name) in self.plan.order().iter().enumerate() {
            let level = self.plan.level_of(name).unwrap_or_default();
            let _ = writeln!(out, "{:>3} {:>3} {}", pos, level, name);
        }
        out
    }

    pub fn tunings(&self) -> &[Tuning] {
        self.registry.tunings()
    }

    /// Declared settings as a tuning file with their defaults.
    pub fn dump_tuning(&self) -> String {
        let mut out = String::new();
        for tuning in self.registry.tunings() {
            let _ = writeln!(out, "# {}", tuning.help);
            match &tuning.default {
                Some(default) => {
                    let _ = writeln!(out, "{} = {}", tuning.name, settings::quote(default));
                }
                None => {
                    let _ = writeln!(out, "# {} =", tuning.name);
                }
            }
        }
        out
    }
}
