//! Attribute-preserving file operations shared by snapshot apply and
//! migration.

use crate::core::error::CommitError;
use nix::unistd::{Gid, Group, Uid, User, geteuid};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt, lchown, symlink};
use std::path::Path;

/// Copy one entry like `cp -a` would: directories are created, symlinks are
/// recreated rather than followed, regular files keep mode and mtime.
/// Ownership is carried over when it differs and we run as root. Sockets,
/// FIFOs and devices are skipped. Returns whether anything was written.
pub fn copy_entry(src: &Path, dst: &Path) -> Result<bool, CommitError> {
    let meta = fs::symlink_metadata(src)?;
    let kind = meta.file_type();
    if kind.is_dir() {
        fs::create_dir_all(dst)?;
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if kind.is_symlink() {
            remove_entry(dst)?;
            symlink(fs::read_link(src)?, dst)?;
        } else if kind.is_file() {
            remove_entry(dst)?;
            fs::copy(src, dst)?;
            fs::File::open(dst)?.set_modified(meta.modified()?)?;
        } else {
            tracing::debug!(path = %src.display(), "skipping special file");
            return Ok(false);
        }
    }
    preserve_owner(&meta, dst)?;
    Ok(true)
}

/// Remove a file or symlink; a missing entry is fine. Directories are left
/// alone.
pub fn remove_entry(path: &Path) -> Result<(), CommitError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path).map_err(CommitError::from),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CommitError::IoError(e)),
    }
}

fn preserve_owner(src: &fs::Metadata, dst: &Path) -> Result<(), CommitError> {
    restore_owner(dst, Some(src.uid()), Some(src.gid()))
}

/// Give `path` the given uid and/or gid where they differ from its current
/// ones. `None` leaves that id alone. Only root can do this; otherwise it is
/// a no-op.
pub fn restore_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), CommitError> {
    let current = fs::symlink_metadata(path)?;
    let uid = uid.filter(|u| *u != current.uid());
    let gid = gid.filter(|g| *g != current.gid());
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    if !geteuid().is_root() {
        tracing::debug!(path = %path.display(), "not root, ownership not preserved");
        return Ok(());
    }
    lchown(path, uid, gid)?;
    Ok(())
}

/// Resolve configured owner and group names to ids.
pub fn lookup_owner(
    owner: Option<&str>,
    group: Option<&str>,
) -> Result<(Option<Uid>, Option<Gid>), CommitError> {
    let uid = match owner {
        Some(name) => Some(
            User::from_name(name)
                .map_err(|e| CommitError::ConfigError(format!("user '{}': {}", name, e)))?
                .ok_or_else(|| CommitError::NotFound(format!("user '{}'", name)))?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            Group::from_name(name)
                .map_err(|e| CommitError::ConfigError(format!("group '{}': {}", name, e)))?
                .ok_or_else(|| CommitError::NotFound(format!("group '{}'", name)))?
                .gid,
        ),
        None => None,
    };
    Ok((uid, gid))
}

/// Apply managed attributes to one entry. Directories gain the execute bit
/// for every class that can read.
pub fn apply_attributes(
    path: &Path,
    mode: Option<u32>,
    uid: Option<Uid>,
    gid: Option<Gid>,
) -> Result<(), CommitError> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if let Some(mode) = mode {
        let mode = if meta.is_dir() {
            mode | ((mode & 0o444) >> 2)
        } else {
            mode
        };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    if uid.is_some() || gid.is_some() {
        lchown(path, uid.map(Uid::as_raw), gid.map(Gid::as_raw))?;
    }
    Ok(())
}
