//! Drives complete passes: fetch events, resolve presence conflicts,
//! replay the result into an accumulation engine.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::accumulate::{AccumulationEngine, EngineError};
use crate::config::{ConfigError, EngineConfig, PresenceConfig, RuleSet};
use crate::conflict::{ConflictResolver, ResolvedTimeline};
use crate::event::{Event, EventKind, PresenceSegment, PresenceState};
use crate::ledger::{Interval, Ledger, LedgerError, MemoryLedger};
use crate::resolver::TagResolver;
use crate::source::{EventSource, SourceError};

/// Anything that can stop a pass.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What one pass consumed, for status output and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub window_events: usize,
    pub presence_transitions: usize,
}

/// Fetches events and prepares them for the engine.
///
/// Owns the conflict resolver and the retry policy. The engine and the
/// tag resolver stay outside so one pipeline can serve many passes over
/// the same source.
#[derive(Debug, Clone)]
pub struct Pipeline<S> {
    source: S,
    conflicts: ConflictResolver,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl<S: EventSource> Pipeline<S> {
    pub fn new(
        engine: &EngineConfig,
        presence: &PresenceConfig,
        source: S,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            source,
            conflicts: ConflictResolver::new(presence.clone())?,
            retry_attempts: engine.retry_attempts.max(1),
            retry_delay: engine.retry_delay(),
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Conflict-resolved timeline for `[start, end)`.
    pub fn timeline(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ResolvedTimeline, SourceError> {
        let presence = self.fetch(EventKind::Presence, start, end)?;
        let windows = self.fetch(EventKind::Window, start, end)?;
        Ok(self.conflicts.resolve(&presence, &windows))
    }

    /// Runs one incremental pass over `[start, end)` against a live ledger.
    ///
    /// Reconciles the engine with external ledger edits first, then
    /// replays the window's events in time order.
    pub fn sync_pass<R, L>(
        &self,
        resolver: &R,
        engine: &mut AccumulationEngine<L>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PassSummary, RunnerError>
    where
        R: TagResolver,
        L: Ledger,
    {
        engine.begin_pass()?;
        let timeline = self.timeline(start, end)?;
        Ok(feed_timeline(engine, resolver, &timeline)?)
    }

    /// Derives the interval timeline for `[start, end)` from scratch.
    ///
    /// Feeds a throwaway engine over an in-memory ledger, then closes the
    /// trailing open interval at the window end. The result is a closed,
    /// gap-free cover from the first export through `end`.
    pub fn derive_intervals<R>(
        &self,
        resolver: &R,
        config: &EngineConfig,
        rules: &RuleSet,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Interval>, RunnerError>
    where
        R: TagResolver,
    {
        let mut engine = AccumulationEngine::new(config, rules, MemoryLedger::new(), start)?;
        let timeline = self.timeline(start, end)?;
        feed_timeline(&mut engine, resolver, &timeline)?;
        let mut ledger = engine.into_ledger();
        if ledger.current_open_interval()?.is_some() {
            ledger.stop(end)?;
        }
        Ok(ledger.all_intervals().to_vec())
    }

    /// Lists one kind of event, retrying transient source failures.
    fn fetch(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, SourceError> {
        let mut attempt = 1;
        loop {
            match self.source.list_events(kind, start, end) {
                Ok(events) => return Ok(events),
                Err(error) if error.is_transient() && attempt < self.retry_attempts => {
                    tracing::warn!(%kind, attempt, %error, "event source failed; retrying");
                    std::thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Replays a resolved timeline into the engine in time order.
///
/// A presence change at the same instant as a window event is applied
/// before the event.
pub fn feed_timeline<R, L>(
    engine: &mut AccumulationEngine<L>,
    resolver: &R,
    timeline: &ResolvedTimeline,
) -> Result<PassSummary, EngineError>
where
    R: TagResolver,
    L: Ledger,
{
    let changes = state_changes(&timeline.presence);
    let mut summary = PassSummary::default();
    let mut next_change = 0;
    for event in &timeline.windows {
        while next_change < changes.len() && changes[next_change].0 <= event.timestamp {
            let (at, state) = changes[next_change];
            engine.process_presence(state, at)?;
            summary.presence_transitions += 1;
            next_change += 1;
        }
        engine.process_event(event, &resolver.resolve(event))?;
        summary.window_events += 1;
    }
    for &(at, state) in &changes[next_change..] {
        engine.process_presence(state, at)?;
        summary.presence_transitions += 1;
    }
    Ok(summary)
}

/// Collapses presence coverage into the state changes the engine needs.
/// A coverage hole carries the previous state, so holes emit nothing.
fn state_changes(presence: &[PresenceSegment]) -> Vec<(DateTime<Utc>, PresenceState)> {
    let mut changes = Vec::new();
    let mut last = None;
    for segment in presence {
        if last != Some(segment.state) {
            changes.push((segment.start, segment.state));
            last = Some(segment.state);
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;

    use crate::ledger::MemoryLedger;
    use crate::resolver::TagDecision;
    use crate::source::MemorySource;
    use crate::types::{EventId, SourceId, Tag, TagSet};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + TimeDelta::seconds(secs)
    }

    fn presence_event(id: &str, offset: i64, duration: i64, state: &str) -> Event {
        Event {
            id: EventId::new(id).unwrap(),
            timestamp: at(offset),
            duration: TimeDelta::seconds(duration),
            kind: EventKind::Presence,
            source: SourceId::new("user-idle").unwrap(),
            payload: json!({ "state": state }),
        }
    }

    fn window_event(id: &str, offset: i64, duration: i64, app: &str) -> Event {
        Event {
            id: EventId::new(id).unwrap(),
            timestamp: at(offset),
            duration: TimeDelta::seconds(duration),
            kind: EventKind::Window,
            source: SourceId::new("window").unwrap(),
            payload: json!({ "app": app }),
        }
    }

    fn by_app(event: &Event) -> TagDecision {
        match event.payload.get("app").and_then(serde_json::Value::as_str) {
            Some("editor") => TagDecision::Matched(tags(&["coding"])),
            Some("slack") => TagDecision::Matched(tags(&["chat"])),
            _ => TagDecision::NoMatch,
        }
    }

    fn tags(names: &[&str]) -> TagSet {
        TagSet::from_names(names.iter().copied()).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn pipeline(source: MemorySource) -> Pipeline<MemorySource> {
        Pipeline::new(&config(), &PresenceConfig::default(), source).unwrap()
    }

    fn engine() -> AccumulationEngine<MemoryLedger> {
        AccumulationEngine::new(&config(), &RuleSet::default(), MemoryLedger::new(), base())
            .unwrap()
    }

    // ========== Pass Tests ==========

    #[test]
    fn a_pass_replays_presence_and_windows_in_time_order() {
        let source = MemorySource::new(vec![
            presence_event("p1", 0, 300, "active"),
            presence_event("p2", 300, 300, "away"),
            presence_event("p3", 600, 300, "active"),
            window_event("w1", 0, 300, "editor"),
            window_event("w2", 600, 300, "editor"),
        ]);
        let mut engine = engine();

        let summary = pipeline(source)
            .sync_pass(&by_app, &mut engine, at(0), at(900))
            .unwrap();
        assert_eq!(
            summary,
            PassSummary {
                window_events: 2,
                presence_transitions: 3,
            }
        );

        let intervals = engine.ledger_mut().all_intervals().to_vec();
        assert_eq!(intervals.len(), 3);
        assert_eq!(
            (intervals[0].start, intervals[0].end),
            (at(0), Some(at(300)))
        );
        assert!(intervals[1].tags.contains(&Tag::new("away").unwrap()));
        assert_eq!(
            (intervals[1].start, intervals[1].end),
            (at(300), Some(at(600)))
        );
        assert_eq!(intervals[2].start, at(600));
        assert!(intervals[2].is_open());
        assert!(intervals[2].tags.contains(&Tag::new("coding").unwrap()));
    }

    #[test]
    fn a_window_only_feed_still_exports() {
        let source = MemorySource::new(vec![window_event("w1", 0, 300, "editor")]);
        let mut engine = engine();

        let summary = pipeline(source)
            .sync_pass(&by_app, &mut engine, at(0), at(300))
            .unwrap();

        assert_eq!(summary.presence_transitions, 0);
        assert_eq!(engine.ledger_mut().ops().len(), 1);
    }

    // ========== Derivation Tests ==========

    #[test]
    fn derivation_closes_the_trailing_interval_at_the_window_end() {
        let source = MemorySource::new(vec![
            presence_event("p1", 0, 900, "active"),
            window_event("w1", 0, 300, "editor"),
            window_event("w2", 300, 300, "slack"),
            window_event("w3", 600, 300, "editor"),
        ]);

        let intervals = pipeline(source)
            .derive_intervals(&by_app, &config(), &RuleSet::default(), at(0), at(900))
            .unwrap();

        assert_eq!(intervals.len(), 3);
        assert!(intervals.iter().all(|interval| !interval.is_open()));
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].end, Some(pair[1].start));
        }
        assert_eq!(intervals[0].start, at(0));
        assert_eq!(intervals[2].end, Some(at(900)));
        assert!(intervals[1].tags.contains(&Tag::new("chat").unwrap()));
    }

    #[test]
    fn an_absence_without_a_return_signal_ends_at_the_next_window_event() {
        let source = MemorySource::new(vec![
            presence_event("p1", 0, 300, "active"),
            presence_event("p2", 300, 300, "away"),
            window_event("w1", 0, 300, "editor"),
            window_event("w2", 600, 300, "editor"),
        ]);

        let intervals = pipeline(source)
            .derive_intervals(&by_app, &config(), &RuleSet::default(), at(0), at(900))
            .unwrap();

        assert_eq!(intervals.len(), 3);
        assert_eq!(
            (intervals[1].start, intervals[1].end),
            (at(300), Some(at(600)))
        );
        assert!(intervals[1].tags.contains(&Tag::new("away").unwrap()));
        assert_eq!(
            (intervals[2].start, intervals[2].end),
            (at(600), Some(at(900)))
        );
    }

    // ========== Retry Tests ==========

    struct FlakySource {
        inner: MemorySource,
        failures: RefCell<u32>,
    }

    impl EventSource for FlakySource {
        fn list_events(
            &self,
            kind: EventKind,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Event>, SourceError> {
            let mut left = self.failures.borrow_mut();
            if *left > 0 {
                *left -= 1;
                return Err(SourceError::Unavailable("socket closed".to_string()));
            }
            self.inner.list_events(kind, start, end)
        }
    }

    #[test]
    fn transient_source_failures_are_retried() {
        let source = FlakySource {
            inner: MemorySource::new(vec![window_event("w1", 0, 300, "editor")]),
            failures: RefCell::new(2),
        };

        let pipeline = Pipeline::new(&config(), &PresenceConfig::default(), source).unwrap();
        let timeline = pipeline.timeline(at(0), at(300)).unwrap();

        assert_eq!(timeline.windows.len(), 1);
    }

    #[test]
    fn retries_run_out_and_the_error_surfaces() {
        let source = FlakySource {
            inner: MemorySource::default(),
            failures: RefCell::new(10),
        };

        let pipeline = Pipeline::new(&config(), &PresenceConfig::default(), source).unwrap();
        let error = pipeline.timeline(at(0), at(300)).unwrap_err();

        assert!(matches!(error, SourceError::Unavailable(_)));
    }

    #[test]
    fn malformed_responses_are_not_retried() {
        struct Broken(RefCell<u32>);

        impl EventSource for Broken {
            fn list_events(
                &self,
                _kind: EventKind,
                _start: DateTime<Utc>,
                _end: DateTime<Utc>,
            ) -> Result<Vec<Event>, SourceError> {
                *self.0.borrow_mut() += 1;
                Err(SourceError::Malformed("truncated body".to_string()))
            }
        }

        let source = Broken(RefCell::new(0));
        let pipeline = Pipeline::new(&config(), &PresenceConfig::default(), &source).unwrap();
        let error = pipeline.timeline(at(0), at(300)).unwrap_err();

        assert!(matches!(error, SourceError::Malformed(_)));
        assert_eq!(*source.0.borrow(), 1);
    }
}
