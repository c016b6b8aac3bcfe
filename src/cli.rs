//! CLI struct definitions for the commitctl command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "commitctl",
    version = env!("CARGO_PKG_VERSION"),
    about = "Appliance configuration commit engine",
    long_about = "Routes settings to modules, commits what changed in dependency order, \
                  and snapshots managed files."
)]
pub(crate) struct Cli {
    /// Engine configuration file (default: $COMMITCTL_CONFIG, then /etc/commitctl/engine.toml).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Diagnostic log format on stderr: 'text', 'json' or 'quiet'.
    #[clap(long = "log-format", global = true, default_value = "text")]
    pub log_format: String,
    /// Print the resolved commit order (position, level, module) and exit.
    #[clap(long)]
    pub dump: bool,
    /// Print every declared setting with its default and exit.
    #[clap(long = "dump_tuning")]
    pub dump_tuning: bool,
    /// Parse, validate and simulate prepare for a settings file; commit nothing.
    #[clap(long = "test", value_name = "SETTINGS_FILE")]
    pub test: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Commit a settings file, or `bootstrap` the committed one.
    Commit {
        /// Settings file path, or the literal `bootstrap`.
        target: String,
        /// Only commit `<module>` or `<module1>-<module2>` (inclusive).
        range: Option<String>,
    },
    /// Parse and validate a settings file without changing anything.
    Validate {
        settings: PathBuf,
    },
    /// Replace the committed settings of the named modules with those in a file.
    Merge {
        settings: PathBuf,
        #[clap(required = true)]
        modules: Vec<String>,
    },
    /// Carry configuration over from a previous installation.
    Migrate {
        prev_version: String,
        prev_root: PathBuf,
    },
    /// Archive collected and managed files into a snapshot.
    #[clap(name = "create_snapshot")]
    CreateSnapshot {
        archive: PathBuf,
        /// Text file stored as the snapshot comment.
        comment: Option<PathBuf>,
    },
    /// Install the managed files of a snapshot, reverting on failure.
    #[clap(name = "apply_snapshot")]
    ApplySnapshot {
        archive: PathBuf,
    },
    /// Deliver an external event to every subscribed module.
    Trigger {
        event: String,
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run shutdown hooks and stop processes named by PID files.
    #[clap(name = "stop_all_processes")]
    StopAllProcesses,
}
