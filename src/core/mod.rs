//! The commit engine.
//!
//! Registry and resolver are built once per invocation; everything else
//! operates on that read-only plan.

pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod files;
pub mod journal;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod patterns;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod settings;
pub mod snapshot;
pub mod status;
