//! Command-line interface for job-forge.
//!
//! Provides commands for running the engine, submitting and inspecting jobs,
//! and managing the dead-letter queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, DlqCommand};
