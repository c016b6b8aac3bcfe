//! `hostname.*`: the appliance host name, committed to `/etc/hostname`.

use crate::core::error::{CommitError, HookResult};
use crate::core::registry::{ModuleHandler, ModuleOptions, Registry};
use crate::core::status::RestartFlags;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const NAME: &str = "hostname";
/// Provided once the host name is committed.
pub const STATE: &str = "HOSTNAME";
pub const DEFAULT_HOSTNAME: &str = "appliance";
const SETTING: &str = "hostname.name";

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap());

/// RFC 1123 host name: dot-separated labels, 253 bytes at most.
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && name.split('.').all(|label| LABEL.is_match(label))
}

pub struct Hostname {
    root: PathBuf,
    name: Option<String>,
    unknown: Vec<String>,
}

impl Hostname {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            name: None,
            unknown: Vec::new(),
        }
    }

    fn effective(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_HOSTNAME)
    }
}

impl ModuleHandler for Hostname {
    fn parse(&mut self, name: &str, value: &str, new_pass: bool) -> HookResult {
        if !new_pass {
            return Ok(());
        }
        if name == SETTING {
            self.name = Some(value.to_string());
        } else {
            self.unknown.push(name.to_string());
        }
        Ok(())
    }

    fn validate(&mut self) -> HookResult {
        if !self.unknown.is_empty() {
            return Err(format!("unknown settings: {}", self.unknown.join(", ")));
        }
        let name = self.effective();
        if !is_valid_hostname(name) {
            return Err(format!("'{}' is not a valid host name", name));
        }
        Ok(())
    }

    fn commit(&mut self, modified: bool) -> HookResult<RestartFlags> {
        if !modified {
            return Ok(RestartFlags::empty());
        }
        let target = self.root.join("etc/hostname");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::write(&target, format!("{}\n", self.effective()))
            .map_err(|e| format!("{}: {}", target.display(), e))?;
        tracing::info!(hostname = self.effective(), "host name committed");
        Ok(RestartFlags::empty())
    }
}

pub fn register(registry: &mut Registry, root: &Path) -> Result<(), CommitError> {
    registry.register_module(NAME, ModuleOptions::default(), Box::new(Hostname::new(root)))?;
    registry.register_state(NAME, STATE)?;
    registry.register_tuning(
        NAME,
        SETTING,
        Some(DEFAULT_HOSTNAME),
        "Host name of the appliance (RFC 1123).",
    )?;
    registry.register_migrate(NAME, &["/etc/hostname"])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_rules() {
        assert!(is_valid_hostname("appliance"));
        assert!(is_valid_hostname("edge-01.example.com"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-edge"));
        assert!(!is_valid_hostname("edge_01"));
        assert!(!is_valid_hostname("a..b"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
    }
}
