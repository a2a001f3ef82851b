//! Topics daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations over a `TopicsWorker`

pub mod cli;
pub mod commands;

pub use cli::{AdminCommands, Cli, Commands};
pub use commands::{
    dispatch, handle_admin, load_settings, open_worker, run_command, run_tick, start_daemon,
};
