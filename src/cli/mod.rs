//! CLI module for promptfleet - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running a simulated
//! workload, inspecting the effective configuration, and reading checkpoints.

pub mod commands;

pub use commands::Cli;
