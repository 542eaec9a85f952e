//! Command-line interface for genqueue.
//!
//! Provides queue inspection, lease reaping and AI task submission.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
