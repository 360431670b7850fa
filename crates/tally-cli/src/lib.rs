//! Time accounting CLI library.
//!
//! This crate wires the reduction engine to a SQLite event store and a
//! JSON file ledger, and exposes the subcommands of the `tally` binary.

mod cli;
pub mod commands;
mod config;
mod ledger;
mod resolver;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use ledger::FileLedger;
pub use resolver::MapResolver;
