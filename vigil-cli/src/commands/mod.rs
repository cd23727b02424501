//! Subcommand implementations.

pub mod completion;
pub mod config;
pub mod render;
pub mod report;
pub mod session;
pub mod snapshot;
pub mod watch;
