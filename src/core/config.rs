//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so an absent default config file means "run
//! with defaults". A config file named explicitly must exist.

use crate::core::error::CommitError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/commitctl/engine.toml";
pub const CONFIG_ENV_VAR: &str = "COMMITCTL_CONFIG";

const FORCE_ALL_MARKER: &str = "force-commit-all";
const REBOOT_MARKER: &str = "reboot-required";
const SECURITY_ERROR_MARKER: &str = "security-error";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub lock: LockConfig,
    pub snapshot: SnapshotConfig,
    pub shutdown: ShutdownConfig,
    pub migrate: MigrateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub committed_settings: PathBuf,
    pub system_settings: PathBuf,
    pub lock_file: PathBuf,
    pub state_dir: PathBuf,
    pub module_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            committed_settings: PathBuf::from("/var/lib/commitctl/settings.tune"),
            system_settings: PathBuf::from("/etc/commitctl/system.tune"),
            lock_file: PathBuf::from("/run/commitctl/commit.lock"),
            state_dir: PathBuf::from("/var/lib/commitctl"),
            module_root: PathBuf::from("/"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    pub patterns: Vec<SnapshotPattern>,
}

/// One collection pattern. `managed` patterns are installed on apply with
/// the configured owner, group and mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotPattern {
    pub pattern: String,
    pub managed: bool,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Octal permission bits, e.g. `"0644"`.
    pub mode: Option<String>,
}

impl SnapshotPattern {
    pub fn collect(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            ..Self::default()
        }
    }

    pub fn managed(pattern: &str, mode: Option<&str>) -> Self {
        Self {
            pattern: pattern.to_string(),
            managed: true,
            mode: mode.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn mode_bits(&self) -> Result<Option<u32>, CommitError> {
        let Some(mode) = &self.mode else {
            return Ok(None);
        };
        u32::from_str_radix(mode.trim_start_matches("0o"), 8)
            .ok()
            .filter(|bits| *bits <= 0o7777)
            .map(Some)
            .ok_or_else(|| {
                CommitError::ConfigError(format!(
                    "snapshot pattern '{}' has invalid mode '{}'",
                    self.pattern, mode
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub pid_files: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            pid_files: Vec::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrateConfig {
    pub patterns: Vec<String>,
}

impl EngineConfig {
    /// Load from an explicit path, else `$COMMITCTL_CONFIG`, else the default
    /// location (which may be absent).
    pub fn load(explicit: Option<&Path>) -> Result<Self, CommitError> {
        let from_env = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, CommitError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CommitError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, CommitError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.check()?;
        Ok(config)
    }

    /// Configuration with every path placed under `root`; used by tests and
    /// for staging an appliance image.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                committed_settings: root.join("var/lib/commitctl/settings.tune"),
                system_settings: root.join("etc/commitctl/system.tune"),
                lock_file: root.join("run/commitctl/commit.lock"),
                state_dir: root.join("var/lib/commitctl"),
                module_root: root.to_path_buf(),
            },
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), CommitError> {
        for pattern in &self.snapshot.patterns {
            if !pattern.pattern.starts_with('/') {
                return Err(CommitError::ConfigError(format!(
                    "snapshot pattern '{}' must be absolute",
                    pattern.pattern
                )));
            }
            pattern.mode_bits()?;
            if !pattern.managed
                && (pattern.owner.is_some() || pattern.group.is_some() || pattern.mode.is_some())
            {
                return Err(CommitError::ConfigError(format!(
                    "snapshot pattern '{}' sets ownership but is not managed",
                    pattern.pattern
                )));
            }
        }
        for pattern in &self.migrate.patterns {
            if !pattern.starts_with('/') {
                return Err(CommitError::ConfigError(format!(
                    "migrate pattern '{}' must be absolute",
                    pattern
                )));
            }
        }
        Ok(())
    }

    pub fn force_all_marker(&self) -> PathBuf {
        self.paths.state_dir.join(FORCE_ALL_MARKER)
    }

    pub fn reboot_marker(&self) -> PathBuf {
        self.paths.state_dir.join(REBOOT_MARKER)
    }

    pub fn security_error_marker(&self) -> PathBuf {
        self.paths.state_dir.join(SECURITY_ERROR_MARKER)
    }

    /// Record that the running system needs a reboot.
    pub fn mark_reboot_required(&self, reason: &str) -> Result<(), CommitError> {
        fs::create_dir_all(&self.paths.state_dir)?;
        fs::write(self.reboot_marker(), format!("{}\n", reason))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.lock.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_snapshot_patterns_parse() {
        let config = EngineConfig::from_toml_str(
            r#"
[paths]
state_dir = "/tmp/state"

[[snapshot.patterns]]
pattern = "/etc/ssh/sshd_config"
managed = true
owner = "root"
group = "root"
mode = "0600"

[[snapshot.patterns]]
pattern = "/var/log/*.log"
"#,
        )
        .unwrap();
        assert_eq!(config.paths.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.snapshot.patterns.len(), 2);
        assert_eq!(config.snapshot.patterns[0].mode_bits().unwrap(), Some(0o600));
        assert!(!config.snapshot.patterns[1].managed);
        assert_eq!(config.reboot_marker(), PathBuf::from("/tmp/state/reboot-required"));
    }

    #[test]
    fn test_rejects_bad_patterns() {
        let relative = "[[snapshot.patterns]]\npattern = \"etc/x\"\n";
        assert!(EngineConfig::from_toml_str(relative).is_err());
        let bad_mode = "[[snapshot.patterns]]\npattern = \"/x\"\nmanaged = true\nmode = \"0999\"\n";
        assert!(EngineConfig::from_toml_str(bad_mode).is_err());
        let unmanaged_owner = "[[snapshot.patterns]]\npattern = \"/x\"\nowner = \"root\"\n";
        assert!(EngineConfig::from_toml_str(unmanaged_owner).is_err());
        assert!(EngineConfig::from_toml_str("[bogus]\n").is_err());
    }
}
