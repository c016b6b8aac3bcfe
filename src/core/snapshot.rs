//! Whole-appliance snapshots.
//!
//! An archive is a zip of the collected files at their absolute paths minus
//! the leading `/`, a top-level `Comment` entry, an optional `Warnings`
//! entry listing collection problems, and whatever snapshot modules dropped
//! into the working tree. Apply installs only files matching *managed*
//! patterns and reverts them from a backup if installation or any module
//! apply hook fails.

use crate::core::config::{EngineConfig, SnapshotPattern};
use crate::core::error::CommitError;
use crate::core::files;
use crate::core::journal::Journal;
use crate::core::patterns::{self, slash_path};
use crate::core::registry::Registry;
use crate::core::resolver::CommitPlan;
use crate::core::status::{Outcome, RestartFlags};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use ulid::Ulid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const COMMENT_ENTRY: &str = "Comment";
pub const WARNINGS_ENTRY: &str = "Warnings";

/// Which ids of an incoming entry are set by its managed pattern. The
/// others are taken from the live entry it replaces.
#[derive(Debug, Clone, Copy, Default)]
struct Configured {
    owner: bool,
    group: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateReport {
    pub archive: PathBuf,
    pub entries: usize,
    pub warnings: Vec<String>,
}

/// Scratch directory under the state dir, removed on drop.
struct Scratch(PathBuf);

impl Scratch {
    fn new(state_dir: &Path) -> Result<Self, CommitError> {
        let dir = state_dir.join(format!("snapshot-{}", Ulid::new()));
        fs::create_dir_all(&dir)?;
        Ok(Self(dir))
    }

    fn join(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

pub struct SnapshotManager<'a> {
    registry: &'a mut Registry,
    plan: &'a CommitPlan,
    config: &'a EngineConfig,
    journal: Journal,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(registry: &'a mut Registry, plan: &'a CommitPlan, config: &'a EngineConfig) -> Self {
        Self {
            registry,
            plan,
            config,
            journal: Journal::new(&config.paths.state_dir),
        }
    }

    fn root(&self) -> &Path {
        &self.config.paths.module_root
    }

    /// Snapshot modules in commit order.
    fn participants(&self) -> Vec<String> {
        let registered = self.registry.snapshot_participants();
        self.plan
            .order()
            .iter()
            .filter(|m| registered.contains(m))
            .cloned()
            .collect()
    }

    pub fn create(
        &mut self,
        archive: &Path,
        comment: Option<&Path>,
    ) -> Result<CreateReport, CommitError> {
        let result = self.create_inner(archive, comment);
        match &result {
            Ok(report) => self.journal.record(
                "snapshot.create",
                None,
                "ok",
                Some(&format!("{} entries, {} warnings", report.entries, report.warnings.len())),
            ),
            Err(err) => self.journal.record(
                "snapshot.create",
                err.module_name(),
                "failed",
                Some(&err.to_string()),
            ),
        }
        result
    }

    fn create_inner(
        &mut self,
        archive: &Path,
        comment: Option<&Path>,
    ) -> Result<CreateReport, CommitError> {
        let comment = match comment {
            Some(path) => fs::read_to_string(path)?,
            None => String::new(),
        };
        let scratch = Scratch::new(&self.config.paths.state_dir)?;
        let tree = scratch.join("tree");
        fs::create_dir_all(&tree)?;

        let mut warnings = Vec::new();
        for pattern in &self.config.snapshot.patterns {
            if let Err(err) = self.stage_pattern(pattern, &tree) {
                tracing::warn!(
                    pattern = %pattern.pattern,
                    error = %err,
                    "snapshot collection problem"
                );
                warnings.push(format!("{}: {}", pattern.pattern, err));
            }
        }

        for module in self.participants() {
            if let Some(handler) = self.registry.handler_mut(&module) {
                handler
                    .snapshot_create(&tree)
                    .map_err(|e| CommitError::module(&module, "snapshot-create", e))?;
            }
        }

        fs::write(tree.join(COMMENT_ENTRY), comment)?;
        if !warnings.is_empty() {
            fs::write(tree.join(WARNINGS_ENTRY), warnings.join("\n") + "\n")?;
        }

        let entries = package(&tree, archive)?;
        tracing::info!(archive = %archive.display(), entries, "snapshot created");
        Ok(CreateReport {
            archive: archive.to_path_buf(),
            entries,
            warnings,
        })
    }

    fn stage_pattern(&self, pattern: &SnapshotPattern, tree: &Path) -> Result<(), CommitError> {
        let root = self.root();
        let matches = patterns::expand_under(root, &pattern.pattern)?;
        if matches.is_empty() {
            tracing::debug!(pattern = %pattern.pattern, "snapshot pattern matched nothing");
        }
        for found in matches {
            for path in patterns::collect_tree(&found)? {
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                files::copy_entry(&path, &tree.join(rel))?;
            }
        }
        Ok(())
    }

    /// Install the managed files of `archive`. `Err` means nothing was left
    /// changed (or the revert was attempted); a failed `Outcome` means a
    /// module apply hook failed and everything was rolled back.
    pub fn apply(&mut self, archive: &Path) -> Result<Outcome, CommitError> {
        let result = self.apply_inner(archive);
        match &result {
            Ok(outcome) => {
                let status = if outcome.success { "ok" } else { "failed" };
                let detail = outcome.failures.join("; ");
                self.journal.record(
                    "snapshot.apply",
                    None,
                    status,
                    (!detail.is_empty()).then_some(detail.as_str()),
                );
            }
            Err(err) => self.journal.record(
                "snapshot.apply",
                err.module_name(),
                "failed",
                Some(&err.to_string()),
            ),
        }
        result
    }

    fn apply_inner(&mut self, archive: &Path) -> Result<Outcome, CommitError> {
        let scratch = Scratch::new(&self.config.paths.state_dir)?;
        let unpacked = scratch.join("unpacked");
        let backup = scratch.join("backup");
        unpack(archive, &unpacked)?;

        let managed: Vec<&SnapshotPattern> = self
            .config
            .snapshot
            .patterns
            .iter()
            .filter(|p| p.managed)
            .collect();

        let incoming = prepare_incoming(&managed, &unpacked)?;
        let prior = self.prior_owners(&incoming);
        let live = self.live_managed_files(&managed)?;
        for rel in &live {
            files::copy_entry(&self.root().join(rel), &backup.join(rel))?;
        }
        tracing::info!(incoming = incoming.len(), backed_up = live.len(), "installing snapshot");

        let mut installed = Vec::new();
        if let Err(err) = self.install(&live, &incoming, &prior, &unpacked, &mut installed) {
            self.revert(&installed, &live, &backup);
            return Err(CommitError::SnapshotError(format!(
                "install failed, managed files reverted: {}",
                err
            )));
        }

        let participants = self.participants();
        let mut flags = RestartFlags::empty();
        let mut failure = None;
        for module in &participants {
            let Some(handler) = self.registry.handler_mut(module) else {
                continue;
            };
            match handler.snapshot_apply(&backup, &unpacked) {
                Ok(raised) => flags |= raised,
                Err(e) => {
                    failure = Some(CommitError::module(module, "snapshot-apply", e));
                    break;
                }
            }
        }

        let Some(failure) = failure else {
            tracing::info!(installed = installed.len(), "snapshot applied");
            return Ok(Outcome::ok().with_flags(flags));
        };

        tracing::error!(error = %failure, "snapshot apply hook failed, rolling back");
        self.revert(&installed, &live, &backup);
        for module in &participants {
            if let Some(handler) = self.registry.handler_mut(module)
                && let Err(e) = handler.snapshot_rollback(&backup)
            {
                tracing::warn!(module = %module, error = %e, "snapshot rollback hook failed");
            }
        }
        Ok(Outcome::failed(failure.to_string()).with_flags(flags))
    }

    /// Non-directory entries currently installed under managed patterns,
    /// relative to the root.
    fn live_managed_files(
        &self,
        managed: &[&SnapshotPattern],
    ) -> Result<BTreeSet<PathBuf>, CommitError> {
        let root = self.root();
        let mut live = BTreeSet::new();
        for pattern in managed {
            for found in patterns::expand_under(root, &pattern.pattern)? {
                for path in patterns::collect_tree(&found)? {
                    if path.symlink_metadata()?.is_dir() {
                        continue;
                    }
                    if let Ok(rel) = path.strip_prefix(root) {
                        live.insert(rel.to_path_buf());
                    }
                }
            }
        }
        Ok(live)
    }

    /// Owner of every live entry that an incoming entry will replace.
    fn prior_owners(
        &self,
        incoming: &BTreeMap<PathBuf, Configured>,
    ) -> BTreeMap<PathBuf, (u32, u32)> {
        let root = self.root();
        incoming
            .keys()
            .filter_map(|rel| {
                let meta = fs::symlink_metadata(root.join(rel)).ok()?;
                Some((rel.clone(), (meta.uid(), meta.gid())))
            })
            .collect()
    }

    fn install(
        &self,
        live: &BTreeSet<PathBuf>,
        incoming: &BTreeMap<PathBuf, Configured>,
        prior: &BTreeMap<PathBuf, (u32, u32)>,
        unpacked: &Path,
        installed: &mut Vec<PathBuf>,
    ) -> Result<(), CommitError> {
        let root = self.root();
        for rel in live {
            files::remove_entry(&root.join(rel))?;
        }
        for (rel, configured) in incoming {
            let src = unpacked.join(rel);
            let dst = root.join(rel);
            let is_dir = src.symlink_metadata()?.is_dir();
            if !files::copy_entry(&src, &dst)? {
                continue;
            }
            if !is_dir {
                installed.push(rel.clone());
            }
            // archives carry no ids: keep the replaced entry's owner
            if let Some((uid, gid)) = prior.get(rel) {
                files::restore_owner(
                    &dst,
                    (!configured.owner).then_some(*uid),
                    (!configured.group).then_some(*gid),
                )?;
            }
        }
        Ok(())
    }

    /// Best effort: failures are logged and the original error stands.
    fn revert(&self, installed: &[PathBuf], live: &BTreeSet<PathBuf>, backup: &Path) {
        let root = self.root();
        for rel in installed {
            if let Err(err) = files::remove_entry(&root.join(rel)) {
                tracing::warn!(
                    path = %rel.display(),
                    error = %err,
                    "revert: could not remove installed file"
                );
            }
        }
        for rel in live {
            if let Err(err) = files::copy_entry(&backup.join(rel), &root.join(rel)) {
                tracing::warn!(
                    path = %rel.display(),
                    error = %err,
                    "revert: could not restore backup"
                );
            }
        }
    }
}

/// Zip `tree` into `archive` (written beside it, then renamed). Returns the
/// number of entries.
fn package(tree: &Path, archive: &Path) -> Result<usize, CommitError> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = archive.with_extension(format!("tmp-{}", Ulid::new()));
    let mut zip = ZipWriter::new(fs::File::create(&tmp)?);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = 0;

    for entry in WalkDir::new(tree).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(tree) else {
            continue;
        };
        let name = slash_path(rel);
        let meta = entry.path().symlink_metadata()?;
        let options = base.unix_permissions(meta.permissions().mode() & 0o7777);
        let kind = meta.file_type();
        if kind.is_dir() {
            zip.add_directory(name, options)?;
        } else if kind.is_symlink() {
            let target = fs::read_link(entry.path())?;
            zip.add_symlink(name, target.to_string_lossy(), options)?;
        } else if kind.is_file() {
            zip.start_file(name, options)?;
            io::copy(&mut fs::File::open(entry.path())?, &mut zip)?;
        } else {
            continue;
        }
        entries += 1;
    }

    zip.finish()?;
    fs::rename(&tmp, archive)?;
    Ok(entries)
}

fn unpack(archive: &Path, dest: &Path) -> Result<(), CommitError> {
    let mut zip = ZipArchive::new(fs::File::open(archive)?)?;
    if !zip.file_names().any(|n| n == COMMENT_ENTRY) {
        return Err(CommitError::SnapshotError(format!(
            "{} is not a snapshot archive (no {} entry)",
            archive.display(),
            COMMENT_ENTRY
        )));
    }
    fs::create_dir_all(dest)?;
    zip.extract(dest)?;
    Ok(())
}

/// Apply managed ownership and modes inside the unpacked tree and list the
/// entries to install, relative to the root, parents first.
fn prepare_incoming(
    managed: &[&SnapshotPattern],
    unpacked: &Path,
) -> Result<BTreeMap<PathBuf, Configured>, CommitError> {
    let mut incoming: BTreeMap<PathBuf, Configured> = BTreeMap::new();
    for pattern in managed {
        let mode = pattern.mode_bits()?;
        let (uid, gid) = files::lookup_owner(pattern.owner.as_deref(), pattern.group.as_deref())?;
        for found in patterns::expand_under(unpacked, &pattern.pattern)? {
            for path in patterns::collect_tree(&found)? {
                files::apply_attributes(&path, mode, uid, gid)?;
                if let Ok(rel) = path.strip_prefix(unpacked) {
                    let configured = incoming.entry(rel.to_path_buf()).or_default();
                    configured.owner |= uid.is_some();
                    configured.group |= gid.is_some();
                }
            }
        }
    }
    Ok(incoming)
}
