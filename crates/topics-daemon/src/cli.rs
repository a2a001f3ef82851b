//! CLI argument parsing for the topics daemon.
//!
//! CLI flags override every other configuration source.

use clap::{Parser, Subcommand};

/// Device Topics Daemon
///
/// Computes per-epoch interest topics from app usage and serves them to
/// apps and their SDKs.
#[derive(Parser, Debug)]
#[command(name = "topics-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/device-topics/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the epoch and reconciliation loop until Ctrl+C or SIGTERM
    Start {
        /// Seconds between ticks
        #[arg(long)]
        tick_interval_secs: Option<u64>,

        /// Newline-separated list of installed packages
        #[arg(long)]
        installed_apps: Option<String>,
    },

    /// Compute the epoch that just ended
    ComputeEpoch,

    /// Record a topics call in the current epoch
    RecordUsage {
        /// Calling app
        app: String,

        /// Calling SDK (omit for a direct app call)
        #[arg(long, default_value = "")]
        sdk: String,
    },

    /// Get topics for an app or app SDK
    GetTopics {
        /// Calling app
        app: String,

        /// Calling SDK (omit for a direct app call)
        #[arg(long, default_value = "")]
        sdk: String,
    },

    /// List topics with consent in the cached window
    KnownTopics,

    /// List topics the user has blocked
    BlockedTopics,

    /// Block a topic
    Block {
        /// Topic id
        topic: i32,

        /// Taxonomy version (default from config)
        #[arg(long)]
        taxonomy_version: Option<i64>,

        /// Model version (default from config)
        #[arg(long)]
        model_version: Option<i64>,
    },

    /// Unblock a topic
    Unblock {
        /// Topic id
        topic: i32,

        /// Taxonomy version (default from config)
        #[arg(long)]
        taxonomy_version: Option<i64>,

        /// Model version (default from config)
        #[arg(long)]
        model_version: Option<i64>,
    },

    /// Reconcile stored state with the installed app list
    Reconcile {
        /// Newline-separated list of installed packages
        #[arg(long)]
        installed_apps: Option<String>,
    },

    /// Handle a single app installation
    Install {
        /// Installed app
        app: String,
    },

    /// Handle a single app uninstallation
    Uninstall {
        /// Uninstalled app
        app: String,
    },

    /// Clear all topics data
    Clear {
        /// Table to keep (repeatable), e.g. blocked_topics
        #[arg(long)]
        exclude: Vec<String>,
    },

    /// Show worker status as JSON
    Status,

    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

/// Admin subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum AdminCommands {
    /// Show database statistics
    Stats,

    /// Trigger RocksDB compaction
    Compact {
        /// Compact only specific column family
        #[arg(long)]
        cf: Option<String>,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
