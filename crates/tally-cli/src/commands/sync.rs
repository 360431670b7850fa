//! Sync command: the polling reduction loop.

use std::io::Write;
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;

use tally_core::{AccumulationEngine, Pipeline, RetryingLedger};

use crate::commands::open_store;
use crate::commands::util::parse_datetime;
use crate::{Config, FileLedger, MapResolver};

/// Reduces stored events into ledger intervals, either once or forever.
///
/// Each pass picks up where the engine's clock stands, so a pass fetches
/// the tail end of the previous window again and still-growing events are
/// re-observed until they settle. `since` seeds the clock when the ledger
/// has no open interval to resume from.
pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    once: bool,
    since: Option<&str>,
) -> Result<()> {
    let since = since
        .map(parse_datetime)
        .transpose()
        .context("invalid --since")?;

    let store = open_store(config)?;
    let resolver = MapResolver::from_config(&config.resolver.apps)?;
    let pipeline = Pipeline::new(&config.engine, &config.presence, store)?;

    let ledger = FileLedger::load(&config.ledger_path)?;
    let ledger = RetryingLedger::new(
        ledger,
        config.engine.retry_attempts,
        config.engine.retry_delay(),
    );
    let origin = since.unwrap_or_else(Utc::now);
    let mut engine = AccumulationEngine::new(&config.engine, &config.rules, ledger, origin)?;
    engine.resume()?;

    loop {
        let start = engine.state().last_tick();
        let now = Utc::now();
        let summary = pipeline.sync_pass(&resolver, &mut engine, start, now)?;
        writeln!(
            writer,
            "{} window events, {} presence transitions",
            summary.window_events, summary.presence_transitions
        )?;
        if once {
            break;
        }
        thread::sleep(config.engine.poll_interval());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use tally_core::{Ledger, TagSet};
    use tally_db::{EventRecord, EventStore};

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config {
            store_path: dir.join("events.db"),
            ledger_path: dir.join("ledger.json"),
            ..Config::default()
        };
        config
            .resolver
            .apps
            .insert("editor".to_string(), vec!["coding".to_string()]);
        config
    }

    fn seed_store(config: &Config) {
        let mut store = EventStore::open(&config.store_path).unwrap();
        store
            .insert_events(&[EventRecord {
                id: "w1".to_string(),
                timestamp: "2024-03-01T09:00:00Z".to_string(),
                duration_ms: 600_000,
                kind: "window".to_string(),
                source: "capture.window".to_string(),
                payload: r#"{"app":"editor"}"#.to_string(),
            }])
            .unwrap();
    }

    #[test]
    fn a_single_pass_reduces_the_store_into_the_ledger() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        seed_store(&config);

        let mut output = Vec::new();
        run(&mut output, &config, true, Some("2024-03-01T08:00:00Z")).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(output, "1 window events, 0 presence transitions\n");

        let mut ledger = FileLedger::load(&config.ledger_path).unwrap();
        let open = ledger.current_open_interval().unwrap().unwrap();
        assert_eq!(open.start, Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        assert_eq!(open.tags, TagSet::from_names(["coding", "~tally"]).unwrap());
    }

    #[test]
    fn a_repeated_pass_resumes_and_rewrites_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        seed_store(&config);

        let mut output = Vec::new();
        run(&mut output, &config, true, Some("2024-03-01T08:00:00Z")).unwrap();
        run(&mut output, &config, true, None).unwrap();

        let mut ledger = FileLedger::load(&config.ledger_path).unwrap();
        let all = ledger
            .intervals(
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_open());
    }

    #[test]
    fn invalid_since_is_rejected_up_front() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());

        let mut output = Vec::new();
        let err = run(&mut output, &config, true, Some("not a time")).unwrap_err();
        assert!(err.to_string().contains("invalid --since"));
    }
}
