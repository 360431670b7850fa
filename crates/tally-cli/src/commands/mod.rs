//! CLI subcommand implementations.

pub mod diff;
pub mod import;
pub mod status;
pub mod sync;
pub mod util;
pub mod validate;

use anyhow::{Context, Result};

use tally_db::EventStore;

use crate::Config;

/// Opens the event store, ensuring the parent directory exists.
pub(crate) fn open_store(config: &Config) -> Result<EventStore> {
    if let Some(parent) = config.store_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create store directory")?;
    }
    EventStore::open(&config.store_path)
        .with_context(|| format!("failed to open {}", config.store_path.display()))
}
