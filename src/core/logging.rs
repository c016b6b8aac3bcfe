//! Diagnostic logging setup.
//!
//! Call [`init`] once at startup; later calls are no-ops. `RUST_LOG`
//! overrides the default filter.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "commitctl=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable lines on stderr.
    Human,
    /// JSON lines on stderr, for log shippers.
    Json,
    /// No output; tests and library embedding.
    Quiet,
}

impl Profile {
    pub fn from_format(format: &str) -> Self {
        match format {
            "json" => Profile::Json,
            "quiet" | "none" => Profile::Quiet,
            _ => Profile::Human,
        }
    }
}

static INIT_ONCE: Once = Once::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| match profile {
        Profile::Human => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_env_filter(filter())
                .init();
        }
        Profile::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter())
                .init();
        }
        Profile::Quiet => {
            tracing_subscriber::registry().init();
        }
    });
}
