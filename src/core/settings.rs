//! Tuning-file parsing and change detection.
//!
//! A tuning file is a list of `name = value` lines. The first dot-separated
//! component of `name` selects the owning module; `sys.` lines belong to the
//! system section and are only accepted from the system settings file.
//! Blank lines and `#` comments are ignored. Values may be double-quoted with
//! `\"` and `\\` escapes.

use crate::core::digest::{SettingsDigest, SettingsHasher};
use crate::core::error::CommitError;
use crate::core::registry::{self, Registry};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::LazyLock;

static LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^=\s]+)\s*=\s*(.*?)\s*$").unwrap());

/// Which side of the diff a parse feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// The last-committed settings.
    Current,
    /// The candidate settings.
    New,
}

impl Pass {
    pub fn is_new(self) -> bool {
        self == Pass::New
    }
}

/// Which file a parse reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// The system settings file: only `sys.` lines.
    System,
    /// An operator settings file: no `sys.` lines.
    Modules,
}

/// How to treat a settings file that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingFile {
    /// Nothing committed yet; parse nothing.
    Tolerate,
    /// The file was named explicitly; missing is an error.
    Fail,
}

/// One decoded settings line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingLine {
    pub name: String,
    /// Value as written (quotes included), fed to the digest.
    pub raw_value: String,
    /// Value with quotes and escapes removed, handed to callbacks.
    pub value: String,
}

impl SettingLine {
    /// Owning module: everything before the first `.`.
    pub fn prefix(&self) -> &str {
        module_prefix(&self.name)
    }
}

pub fn module_prefix(name: &str) -> &str {
    name.split('.').next().unwrap_or_default()
}

/// Decode one line. `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<SettingLine>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let caps = LINE_PATTERN
        .captures(line)
        .ok_or_else(|| format!("expected 'name = value', got '{}'", trimmed))?;
    let name = caps[1].to_string();
    let raw_value = caps[2].to_string();
    let value = unquote(&raw_value)?;
    Ok(Some(SettingLine {
        name,
        raw_value,
        value,
    }))
}

fn unquote(raw: &str) -> Result<String, String> {
    let Some(body) = raw.strip_prefix('"') else {
        return Ok(raw.to_string());
    };
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('"' | '\\')) => out.push(escaped),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err("dangling escape at end of quoted value".to_string()),
            },
            '"' => {
                let rest: String = chars.collect();
                if !rest.trim().is_empty() {
                    return Err(format!("unexpected text after closing quote: '{}'", rest));
                }
                return Ok(out);
            }
            other => out.push(other),
        }
    }
    Err("unterminated quoted value".to_string())
}

/// Quote a value for writing back to a tuning file when needed.
pub fn quote(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.starts_with('"')
        || value.starts_with('#')
        || value != value.trim();
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Per-module digests for both passes, and the resulting modified status.
#[derive(Default)]
pub struct ChangeDetector {
    bootstrap: bool,
    current: BTreeMap<String, SettingsHasher>,
    new: BTreeMap<String, SettingsHasher>,
    finalized: BTreeMap<String, (SettingsDigest, SettingsDigest)>,
}

impl ChangeDetector {
    pub fn new(bootstrap: bool) -> Self {
        Self {
            bootstrap,
            ..Self::default()
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn update(&mut self, module: &str, pass: Pass, name: &str, raw_value: &str) {
        let side = match pass {
            Pass::Current => &mut self.current,
            Pass::New => &mut self.new,
        };
        side.entry(module.to_string()).or_default().update(name, raw_value);
    }

    /// Consume the running hashes of every named module into digests.
    pub fn finalize<'a>(&mut self, modules: impl IntoIterator<Item = &'a str>) {
        for module in modules {
            let current = self.current.remove(module).unwrap_or_default().finalize();
            let new = self.new.remove(module).unwrap_or_default().finalize();
            self.finalized.insert(module.to_string(), (current, new));
        }
    }

    pub fn digests(&self, module: &str) -> Option<(SettingsDigest, SettingsDigest)> {
        self.finalized.get(module).copied()
    }

    /// Always true when bootstrapping; otherwise whether the finalized
    /// digests of the two passes differ.
    pub fn is_modified(&self, module: &str) -> bool {
        if self.bootstrap {
            return true;
        }
        match self.finalized.get(module) {
            Some((current, new)) => current.as_bytes() != new.as_bytes(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub settings: usize,
    pub skipped: usize,
}

fn open_settings(path: &Path, missing: MissingFile) -> Result<Option<fs::File>, CommitError> {
    match fs::File::open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == io::ErrorKind::NotFound && missing == MissingFile::Tolerate => {
            tracing::info!(path = %path.display(), "settings file absent, nothing to parse");
            Ok(None)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CommitError::NotFound(format!(
            "settings file {}",
            path.display()
        ))),
        Err(e) => Err(CommitError::IoError(e)),
    }
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> CommitError {
    CommitError::ParseError {
        path: path.display().to_string(),
        line,
        message: message.into(),
    }
}

/// Parse one tuning file, feeding digests and every parse callback of the
/// owning module and its observers.
pub fn parse_file(
    registry: &mut Registry,
    detector: &mut ChangeDetector,
    path: &Path,
    pass: Pass,
    section: Section,
    missing: MissingFile,
) -> Result<ParseStats, CommitError> {
    let mut stats = ParseStats::default();
    let Some(file) = open_settings(path, missing)? else {
        return Ok(stats);
    };

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        stats.lines += 1;
        let setting = match parse_line(&line) {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(msg) => return Err(parse_error(path, line_no, msg)),
        };
        let module = setting.prefix().to_string();

        let is_system = module == registry::SYS;
        match (section, is_system) {
            (Section::Modules, true) => {
                return Err(parse_error(
                    path,
                    line_no,
                    format!("'{}' belongs to the system section", setting.name),
                ));
            }
            (Section::System, false) => {
                return Err(parse_error(
                    path,
                    line_no,
                    format!("'{}' is not a system setting", setting.name),
                ));
            }
            _ => {}
        }

        if !registry.contains(&module) || (registry::is_anchor(&module) && !is_system) {
            tracing::warn!(
                path = %path.display(),
                line = line_no,
                setting = %setting.name,
                "no module owns this setting, skipping"
            );
            stats.skipped += 1;
            continue;
        }

        detector.update(&module, pass, &setting.name, &setting.raw_value);
        dispatch_parse(registry, &module, &setting, pass)
            .map_err(|msg| parse_error(path, line_no, msg))?;
        stats.settings += 1;
    }

    tracing::debug!(
        path = %path.display(),
        pass = ?pass,
        settings = stats.settings,
        skipped = stats.skipped,
        "parsed settings file"
    );
    Ok(stats)
}

fn dispatch_parse(
    registry: &mut Registry,
    module: &str,
    setting: &SettingLine,
    pass: Pass,
) -> Result<(), String> {
    let observers = registry.observers_of(module);
    if let Some(handler) = registry.handler_mut(module) {
        handler
            .parse(&setting.name, &setting.value, pass.is_new())
            .map_err(|e| format!("module '{}' rejected '{}': {}", module, setting.name, e))?;
    }
    for observer in observers.iter().filter(|o| o.parse) {
        if let Some(handler) = registry.handler_mut(&observer.watcher) {
            handler
                .observe_parse(module, &setting.name, &setting.value, pass.is_new())
                .map_err(|e| {
                    format!(
                        "observer '{}' rejected '{}': {}",
                        observer.watcher, setting.name, e
                    )
                })?;
        }
    }
    Ok(())
}

/// Build a hybrid settings file: every line of `committed` except those of
/// the `excluded` modules, followed by exactly the `excluded` modules' lines
/// from `replacement`. Returns the number of lines written.
pub fn merge_settings(
    registry: &Registry,
    committed: &Path,
    replacement: &Path,
    excluded: &BTreeSet<String>,
    sink: &mut impl Write,
) -> Result<usize, CommitError> {
    for module in excluded {
        if !registry.contains(module) || registry::is_anchor(module) {
            return Err(CommitError::NotFound(format!("module '{}' to merge", module)));
        }
    }

    let mut written = 0;
    let sources = [
        (committed, MissingFile::Tolerate, false),
        (replacement, MissingFile::Fail, true),
    ];
    for (path, missing, keep_excluded) in sources {
        let Some(file) = open_settings(path, missing)? else {
            continue;
        };
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let setting = match parse_line(&line) {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(msg) => return Err(parse_error(path, idx + 1, msg)),
            };
            if excluded.contains(setting.prefix()) == keep_excluded {
                writeln!(sink, "{} = {}", setting.name, setting.raw_value)?;
                written += 1;
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_plain_and_quoted() {
        let s = parse_line("  net.if = eth0 ").unwrap().unwrap();
        assert_eq!((s.name.as_str(), s.value.as_str()), ("net.if", "eth0"));

        let s = parse_line(r#"motd.banner = "say \"hi\" \\o/""#).unwrap().unwrap();
        assert_eq!(s.value, r#"say "hi" \o/"#);
        assert_eq!(s.raw_value, r#""say \"hi\" \\o/""#);

        assert!(parse_line("# comment").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("no equals sign").is_err());
        assert!(parse_line(r#"a.b = "open"#).is_err());
    }

    #[test]
    fn test_prefix_of_double_dot_name() {
        let s = parse_line("net..if=foo").unwrap().unwrap();
        assert_eq!(s.name, "net..if");
        assert_eq!(s.prefix(), "net");
    }

    #[test]
    fn test_quote_round_trips_through_parse() {
        for value in ["plain", "", " padded ", "\"q\"", "#hash"] {
            let line = format!("m.k = {}", quote(value));
            assert_eq!(parse_line(&line).unwrap().unwrap().value, value);
        }
    }

    #[test]
    fn test_bootstrap_is_always_modified() {
        let mut detector = ChangeDetector::new(true);
        detector.finalize(["a"]);
        assert!(detector.is_modified("a"));
        assert!(detector.is_modified("never-parsed"));
    }
}
