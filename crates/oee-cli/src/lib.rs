//! OEE engine CLI library.
//!
//! This crate provides the CLI interface for the rollup engine.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, MasterAction, QueryAction};
pub use config::Config;
