//! Built-in client modules.
//!
//! Adding a module: append one entry to `BUILTIN_MODULES`.

pub mod hostname;
pub mod motd;

use crate::core::config::EngineConfig;
use crate::core::error::CommitError;
use crate::core::registry::Registry;
use std::path::Path;

pub(crate) struct BuiltinModule {
    pub name: &'static str,
    pub register: fn(&mut Registry, &Path) -> Result<(), CommitError>,
}

pub(crate) const BUILTIN_MODULES: &[BuiltinModule] = &[
    BuiltinModule { name: hostname::NAME, register: hostname::register },
    BuiltinModule { name: motd::NAME, register: motd::register },
];

/// Registry holding the anchors and every built-in module, writing under
/// `paths.module_root`.
pub fn register_builtin(config: &EngineConfig) -> Result<Registry, CommitError> {
    let mut registry = Registry::new();
    for module in BUILTIN_MODULES {
        (module.register)(&mut registry, &config.paths.module_root)?;
        tracing::trace!(module = module.name, "registered built-in module");
    }
    Ok(registry)
}
