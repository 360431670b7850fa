//! Diff command comparing the ledger against a re-derived timeline.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use tally_core::reconcile;
use tally_core::{Ledger, Pipeline, ReconciliationEngine, TagSet};

use crate::commands::open_store;
use crate::commands::util::parse_datetime;
use crate::{Config, FileLedger, MapResolver};

/// One applied correction and how it went.
#[derive(Debug, Serialize)]
struct ApplyOutcome<'a> {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tags: &'a TagSet,
    applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Prints every classified overlap row, then every proposed correction,
/// one JSON object per line. With `apply`, corrections are written to the
/// ledger and each write's outcome is printed as well.
pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    start: &str,
    end: &str,
    apply: bool,
) -> Result<()> {
    let start = parse_datetime(start).context("invalid start time")?;
    let end = parse_datetime(end).context("invalid end time")?;
    anyhow::ensure!(start < end, "start must be before end");

    let store = open_store(config)?;
    let resolver = MapResolver::from_config(&config.resolver.apps)?;
    let pipeline = Pipeline::new(&config.engine, &config.presence, store)?;
    let derived =
        pipeline.derive_intervals(&resolver, &config.engine, &config.rules, start, end)?;

    let mut ledger = FileLedger::load(&config.ledger_path)?;
    let recorded = ledger.intervals(start, end)?;

    let engine = ReconciliationEngine::new(&config.engine, &config.rules)?;
    let report = engine.reconcile(&derived, &recorded);
    tracing::debug!(
        rows = report.rows.len(),
        corrections = report.corrections.len(),
        "reconciled {start} to {end}"
    );

    for row in &report.rows {
        writeln!(writer, "{}", serde_json::to_string(row)?)?;
    }
    for correction in &report.corrections {
        writeln!(writer, "{}", serde_json::to_string(correction)?)?;
    }

    if apply {
        for (correction, result) in reconcile::apply_corrections(&mut ledger, &report.corrections)
        {
            let outcome = ApplyOutcome {
                start: correction.start,
                end: correction.end,
                tags: &correction.tags,
                applied: result.is_ok(),
                error: result.err().map(|err| err.to_string()),
            };
            writeln!(writer, "{}", serde_json::to_string(&outcome)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn run_diff(config: &Config, apply: bool) -> Vec<String> {
        let mut output = Vec::new();
        run(
            &mut output,
            config,
            "2024-03-01T09:00:00Z",
            "2024-03-01T10:00:00Z",
            apply,
        )
        .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn an_empty_ledger_yields_missing_rows_and_corrections() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        seed_store(&config);

        let lines = run_diff(&config, false);
        assert_eq!(
            lines,
            vec![
                r#"{"start":"2024-03-01T09:00:00Z","end":"2024-03-01T10:00:00Z","category":"missing","ledger_tags":[],"derived_tags":["coding"]}"#,
                r#"{"start":"2024-03-01T09:00:00Z","end":"2024-03-01T10:00:00Z","tags":["coding","~tally"]}"#,
            ]
        );
    }

    #[test]
    fn applied_corrections_converge_to_a_settled_report() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        seed_store(&config);

        let lines = run_diff(&config, true);
        assert_eq!(
            lines.last().map(String::as_str),
            Some(
                r#"{"start":"2024-03-01T09:00:00Z","end":"2024-03-01T10:00:00Z","tags":["coding","~tally"],"applied":true}"#
            )
        );

        // The correction landed in the ledger, so a second diff reports a
        // clean match and proposes nothing further.
        let lines = run_diff(&config, false);
        assert_eq!(
            lines,
            vec![
                r#"{"start":"2024-03-01T09:00:00Z","end":"2024-03-01T10:00:00Z","category":"matching","ledger_tags":["coding"],"derived_tags":["coding"]}"#,
            ]
        );
    }

    #[test]
    fn manual_ledger_entries_are_reported_but_never_corrected() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        // Empty store: nothing derives. The operator tracked an hour by hand.
        EventStore::open(&config.store_path).unwrap();
        let mut ledger = FileLedger::load(&config.ledger_path).unwrap();
        ledger
            .track(
                parse_datetime("2024-03-01T09:00:00Z").unwrap(),
                parse_datetime("2024-03-01T10:00:00Z").unwrap(),
                &TagSet::from_names(["meeting"]).unwrap(),
            )
            .unwrap();

        let lines = run_diff(&config, true);
        assert_eq!(
            lines,
            vec![
                r#"{"start":"2024-03-01T09:00:00Z","end":"2024-03-01T10:00:00Z","category":"extra","ledger_tags":["meeting"],"derived_tags":[]}"#,
            ]
        );
    }

    #[test]
    fn reversed_windows_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());

        let mut output = Vec::new();
        let err = run(
            &mut output,
            &config,
            "2024-03-01T10:00:00Z",
            "2024-03-01T09:00:00Z",
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("start must be before end"));
    }
}
