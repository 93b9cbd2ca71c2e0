//! CLI subcommand implementations.

pub mod fetch;
pub mod list;
pub mod verify;

/// Uniform error type for command results.
pub type CommandError = Box<dyn std::error::Error>;
