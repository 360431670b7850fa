//! Import command for loading captured events into the local store.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use tally_core::EventKind;
use tally_db::EventRecord;

use crate::Config;
use crate::commands::open_store;

pub fn run<W: Write>(writer: &mut W, config: &Config, files: &[PathBuf]) -> Result<()> {
    let mut store = open_store(config)?;
    for path in files {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let records = parse_capture(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let inserted = store.insert_events(&records)?;
        writeln!(
            writer,
            "{}: {inserted} imported, {} already present",
            path.display(),
            records.len() - inserted
        )?;
    }
    Ok(())
}

fn parse_capture<R: BufRead>(reader: R) -> Result<Vec<EventRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: CaptureEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON on line {}", idx + 1))?;
        let record = parsed
            .into_record()
            .with_context(|| format!("invalid event on line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// One captured event as the watchers emit it.
#[derive(Debug, Deserialize)]
struct CaptureEvent {
    #[serde(default)]
    id: Option<String>,
    timestamp: String,
    /// Event length in seconds.
    #[serde(default)]
    duration: f64,
    #[serde(rename = "type")]
    kind: String,
    source: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl CaptureEvent {
    fn into_record(self) -> Result<EventRecord> {
        // Normalizes aliases ("afk" and "presence" name the same kind) so
        // kind-filtered queries see one spelling.
        let kind: EventKind = self.kind.parse()?;
        if self.source.trim().is_empty() {
            return Err(anyhow::anyhow!("missing source"));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(anyhow::anyhow!("invalid duration: {}", self.duration));
        }
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        #[expect(
            clippy::cast_possible_truncation,
            reason = "cast saturates and the store rejects out-of-range durations"
        )]
        let duration_ms = (self.duration * 1000.0).round() as i64;
        Ok(EventRecord {
            id,
            timestamp: self.timestamp,
            duration_ms,
            kind: kind.to_string(),
            source: self.source,
            payload: self.data.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn parse_capture_reads_json_lines() {
        let input = r#"{"id":"e1","timestamp":"2024-03-01T09:00:00Z","duration":2.5,"type":"window","source":"capture.window","data":{"app":"editor"}}

{"id":"e2","timestamp":"2024-03-01T09:00:10Z","type":"afk","source":"capture.presence","data":{"status":"afk"}}"#;
        let records = parse_capture(Cursor::new(input)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "e1");
        assert_eq!(records[0].duration_ms, 2500);
        assert_eq!(records[0].kind, "window");
        // The "afk" alias lands under the canonical kind name.
        assert_eq!(records[1].kind, "presence");
        assert_eq!(records[1].duration_ms, 0);
    }

    #[test]
    fn missing_ids_are_generated() {
        let input = r#"{"timestamp":"2024-03-01T09:00:00Z","type":"window","source":"capture.window","data":{}}"#;
        let records = parse_capture(Cursor::new(input)).unwrap();
        assert!(!records[0].id.is_empty());
    }

    #[test]
    fn unknown_kinds_are_rejected_with_line_numbers() {
        let input = r#"{"id":"e1","timestamp":"2024-03-01T09:00:00Z","type":"keyboard","source":"capture","data":{}}"#;
        let err = parse_capture(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("invalid event on line 1"));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let input = r#"{"id":"e1","timestamp":"2024-03-01T09:00:00Z","duration":-1.0,"type":"window","source":"capture","data":{}}"#;
        let err = parse_capture(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("invalid event on line 1"));
    }

    #[test]
    fn invalid_json_is_rejected_with_line_numbers() {
        let input = "{\"id\":\"e1\"\nnot json";
        let err = parse_capture(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("invalid JSON on line 1"));
    }
}
