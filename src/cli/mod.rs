//! CLI module for gatekeeper - command-line interface and subcommands.
//!
//! Operator tooling over the persisted state: limit overrides, learned limits
//! and checkpoints.

pub mod commands;

pub use commands::Cli;
