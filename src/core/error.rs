use std::io;
use thiserror::Error;

/// Result type returned by module callbacks. The message is wrapped into
/// [`CommitError::ModuleFailed`] together with the module name and phase.
pub type HookResult<T = ()> = Result<T, String>;

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    ArchiveError(#[from] zip::result::ZipError),
    #[error("Directory walk error: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Pattern error: {0}")]
    PatternError(String),
    #[error("Registration error: {0}")]
    RegistrationError(String),
    #[error("Parse error in {path} line {line}: {message}")]
    ParseError {
        path: String,
        line: usize,
        message: String,
    },
    #[error("Module '{module}' failed during {phase}: {message}")]
    ModuleFailed {
        module: String,
        phase: String,
        message: String,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Lock error: {0}")]
    LockError(String),
    #[error("Snapshot error: {0}")]
    SnapshotError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl CommitError {
    pub(crate) fn module(module: &str, phase: &str, message: impl Into<String>) -> Self {
        CommitError::ModuleFailed {
            module: module.to_string(),
            phase: phase.to_string(),
            message: message.into(),
        }
    }

    /// Name of the module this error is attributed to, if any.
    pub fn module_name(&self) -> Option<&str> {
        match self {
            CommitError::ModuleFailed { module, .. } => Some(module),
            _ => None,
        }
    }
}
