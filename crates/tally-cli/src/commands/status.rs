//! Status command for store freshness and tracking state.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use tally_core::Ledger;

use crate::commands::open_store;
use crate::{Config, FileLedger};

pub fn run<W: Write>(writer: &mut W, config: &Config, now: DateTime<Utc>) -> Result<()> {
    let store = open_store(config)?;
    let sources = store.source_freshness()?;

    writeln!(writer, "Event store: {}", config.store_path.display())?;
    writeln!(writer, "Ledger: {}", config.ledger_path.display())?;

    if sources.is_empty() {
        writeln!(writer, "No events recorded.")?;
    } else {
        writeln!(writer, "Sources:")?;
        for source in sources {
            let marker = if is_stale(&source.last_event, now, config.stale_after_secs) {
                " (stale)"
            } else {
                ""
            };
            writeln!(writer, "- {}: {}{marker}", source.source, source.last_event)?;
        }
    }

    let mut ledger = FileLedger::load(&config.ledger_path)?;
    match ledger.current_open_interval()? {
        Some(open) => writeln!(
            writer,
            "Tracking: {} since {}",
            open.tags,
            open.start.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?,
        None => writeln!(writer, "Tracking: idle")?,
    }
    Ok(())
}

/// A source is stale when its newest event is older than the configured
/// window. Timestamps that cannot be parsed count as stale.
fn is_stale(last_event: &str, now: DateTime<Utc>, stale_after_secs: u64) -> bool {
    let Ok(last) = DateTime::parse_from_rfc3339(last_event) else {
        return true;
    };
    let Some(window) = i64::try_from(stale_after_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
    else {
        return false;
    };
    now.signed_duration_since(last.with_timezone(&Utc)) > window
}
