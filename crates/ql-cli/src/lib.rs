//! Quota ledger CLI library.
//!
//! This crate provides the CLI interface for the quota ledger.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, IdentityAction};
pub use config::Config;
