//! `motd.*`: login banner committed to `/etc/motd`. `{hostname}` in the
//! banner is replaced by the committed host name, so the banner is rewritten
//! whenever the host name changes.

use crate::core::error::{CommitError, HookResult};
use crate::core::registry::{ModuleHandler, ModuleOptions, Registry};
use crate::core::status::RestartFlags;
use crate::modules::hostname;
use std::fs;
use std::path::{Path, PathBuf};

pub const NAME: &str = "motd";
pub const DEFAULT_BANNER: &str = "Welcome to {hostname}";
const SETTING: &str = "motd.banner";
const MAX_BANNER: usize = 4096;

pub struct Motd {
    root: PathBuf,
    banner: Option<String>,
    hostname: Option<String>,
    hostname_changed: bool,
    unknown: Vec<String>,
}

impl Motd {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            banner: None,
            hostname: None,
            hostname_changed: false,
            unknown: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        let host = self.hostname.as_deref().unwrap_or(hostname::DEFAULT_HOSTNAME);
        self.banner
            .as_deref()
            .unwrap_or(DEFAULT_BANNER)
            .replace("{hostname}", host)
    }
}

impl ModuleHandler for Motd {
    fn parse(&mut self, name: &str, value: &str, new_pass: bool) -> HookResult {
        if !new_pass {
            return Ok(());
        }
        if name == SETTING {
            self.banner = Some(value.to_string());
        } else {
            self.unknown.push(name.to_string());
        }
        Ok(())
    }

    fn observe_parse(
        &mut self,
        _watched: &str,
        name: &str,
        value: &str,
        new_pass: bool,
    ) -> HookResult {
        if new_pass && name == "hostname.name" {
            self.hostname = Some(value.to_string());
        }
        Ok(())
    }

    fn observe_modified(&mut self, _watched: &str, modified: bool) -> HookResult {
        self.hostname_changed = modified;
        Ok(())
    }

    fn validate(&mut self) -> HookResult {
        if !self.unknown.is_empty() {
            return Err(format!("unknown settings: {}", self.unknown.join(", ")));
        }
        let banner = self.banner.as_deref().unwrap_or(DEFAULT_BANNER);
        if banner.len() > MAX_BANNER {
            return Err(format!("banner longer than {} bytes", MAX_BANNER));
        }
        if banner.contains('\0') {
            return Err("banner contains a NUL byte".to_string());
        }
        Ok(())
    }

    fn commit(&mut self, modified: bool) -> HookResult<RestartFlags> {
        if !modified && !self.hostname_changed {
            return Ok(RestartFlags::empty());
        }
        let target = self.root.join("etc/motd");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::write(&target, format!("{}\n", self.render()))
            .map_err(|e| format!("{}: {}", target.display(), e))?;
        Ok(RestartFlags::empty())
    }
}

pub fn register(registry: &mut Registry, root: &Path) -> Result<(), CommitError> {
    let options = ModuleOptions {
        disable_on_security_error: true,
        ..ModuleOptions::default()
    };
    registry.register_module(NAME, options, Box::new(Motd::new(root)))?;
    registry.register_requirement(NAME, hostname::STATE)?;
    registry.register_observer(NAME, hostname::NAME, true, true)?;
    registry.register_tuning(
        NAME,
        SETTING,
        Some(DEFAULT_BANNER),
        "Login banner; {hostname} expands to the host name.",
    )?;
    Ok(())
}
