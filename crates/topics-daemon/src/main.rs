//! Device Topics Daemon
//!
//! Computes per-epoch interest topics from app usage and answers topic
//! queries for apps and their SDKs.
//!
//! # Usage
//!
//! ```bash
//! topics-daemon start [--tick-interval-secs N] [--installed-apps FILE]
//! topics-daemon record-usage <APP> [--sdk SDK]
//! topics-daemon get-topics <APP> [--sdk SDK]
//! topics-daemon status
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/device-topics/config.toml)
//! 3. Environment variables (TOPICS_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use topics_daemon::{dispatch, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dispatch(cli).await
}
