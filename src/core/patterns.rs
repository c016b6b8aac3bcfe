//! Wildcard path patterns used by snapshot collection, migration and PID
//! file discovery.
//!
//! `*` matches within one path component, `?` one character of a component,
//! `**` any number of components. Patterns are absolute and are resolved
//! under a root directory so the same pattern can address the live system
//! (`/`), an unpacked snapshot or a previous installation.

use crate::core::error::CommitError;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Translate a wildcard pattern into an anchored regex.
pub fn compile(pattern: &str) -> Result<Regex, CommitError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| CommitError::PatternError(format!("'{}': {}", pattern, e)))
}

/// Relative form of an absolute pattern or path (`/etc/x` -> `etc/x`).
pub fn relative(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Expand an absolute pattern under `root`. Returns matching paths (files,
/// directories and symlinks) under `root`, sorted. Nothing matching is not
/// an error.
pub fn expand_under(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, CommitError> {
    if !pattern.starts_with('/') {
        return Err(CommitError::PatternError(format!(
            "'{}' is not an absolute pattern",
            pattern
        )));
    }
    let rel = relative(pattern);
    if !has_wildcard(rel) {
        let candidate = root.join(rel);
        return Ok(if candidate.symlink_metadata().is_ok() {
            vec![candidate]
        } else {
            Vec::new()
        });
    }

    let components: Vec<&str> = rel.split('/').filter(|c| !c.is_empty()).collect();
    let literal = components.iter().take_while(|c| !has_wildcard(c)).count();
    let base = components[..literal]
        .iter()
        .fold(root.to_path_buf(), |acc, c| acc.join(c));
    let rest = components[literal..].join("/");
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let matcher = compile(&rest)?;
    let mut walker = WalkDir::new(&base).min_depth(1).follow_links(false);
    if !rest.contains("**") {
        walker = walker.max_depth(components.len() - literal);
    }

    let mut found = Vec::new();
    for entry in walker.sort_by_file_name() {
        let entry = entry?;
        let Ok(rel_entry) = entry.path().strip_prefix(&base) else {
            continue;
        };
        if matcher.is_match(&slash_path(rel_entry)) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

/// Expand against the live filesystem.
pub fn expand(pattern: &str) -> Result<Vec<PathBuf>, CommitError> {
    expand_under(Path::new("/"), pattern)
}

/// `path` itself plus, for directories, everything below it. Parents come
/// before children.
pub fn collect_tree(path: &Path) -> Result<Vec<PathBuf>, CommitError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        out.push(entry?.into_path());
    }
    Ok(out)
}

/// `a/b/c` form of a relative path, for matching and archive entry names.
pub(crate) fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
