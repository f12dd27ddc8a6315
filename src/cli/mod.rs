//! CLI command handlers
//!
//! This module contains the implementation of CLI commands,
//! bridging the clap argument parsing with the audit library.

pub mod demo;
pub mod show;

pub use demo::{handle_demo_command, DemoSummary};
pub use show::{handle_show_command, render_records};
