//! The accumulation engine.
//!
//! Consumes conflict-resolved, tag-resolved events in timestamp order and
//! decides when the ledger should switch to a new tagged interval. Between
//! decisions it accumulates per-tag time; at a decision it resolves
//! exclusive-group conflicts, expands the surviving tags through the retag
//! rules, and issues a guarded write. Re-running the engine over the same
//! events from the same starting state reproduces the same writes.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{ConfigError, EngineConfig, Markers, RuleSet};
use crate::event::{Event, PresenceState};
use crate::expand::TagExpander;
use crate::ledger::{Interval, Ledger, LedgerError};
use crate::resolver::TagDecision;
use crate::state::{AccumulatorState, InvariantViolation};
use crate::types::{Tag, TagSet};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A run of same-tag events too short to credit individually.
///
/// Increments are held back until the run's wall-clock span proves the
/// context is real; a run that breaks before then is discarded as noise.
#[derive(Debug, Clone)]
struct ShortRun {
    tags: TagSet,
    start: DateTime<Utc>,
    last_end: DateTime<Utc>,
    pending: TimeDelta,
}

/// Event-to-interval reduction engine.
pub struct AccumulationEngine<L> {
    config: EngineConfig,
    markers: Markers,
    expander: TagExpander,
    state: AccumulatorState,
    ledger: L,
    short_run: Option<ShortRun>,
    /// The open interval exactly as this engine last wrote it.
    last_written: Option<Interval>,
}

impl<L: Ledger> AccumulationEngine<L> {
    pub fn new(
        config: &EngineConfig,
        rules: &RuleSet,
        ledger: L,
        origin: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let markers = config.markers()?;
        let expander = TagExpander::new(rules, config.expansion_depth)?;
        Ok(Self {
            config: config.clone(),
            markers,
            expander,
            state: AccumulatorState::new(origin),
            ledger,
            short_run: None,
            last_written: None,
        })
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    /// Reconstructs engine state from the ledger's open interval.
    ///
    /// An open interval carrying our provenance marker is adopted and its
    /// span reprocessed; anything else open belongs to the operator and
    /// puts the engine into manual mode.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        let Some(open) = self.ledger.current_open_interval()? else {
            return Ok(());
        };
        self.state.rewind_to(open.start);
        if open.tags.contains(&self.markers.provenance) {
            if open.tags.contains(&self.markers.away) {
                self.state.set_presence(PresenceState::Away).map_err(InvariantViolation::from)?;
            }
            self.last_written = Some(open);
        } else {
            self.enter_manual(&open);
        }
        Ok(())
    }

    /// Adapts to external ledger edits at the top of a processing pass.
    ///
    /// Our own unchanged interval gets its tag expansion refreshed (rules
    /// may have changed since it was written). An interval we did not
    /// write, or one that no longer matches what we wrote, switches the
    /// engine to manual mode seeded from the observed tags.
    pub fn begin_pass(&mut self) -> Result<(), EngineError> {
        let Some(open) = self.ledger.current_open_interval()? else {
            if self.last_written.take().is_some() {
                tracing::info!("open interval disappeared; tracking was stopped externally");
            }
            return Ok(());
        };
        let ours = self
            .last_written
            .as_ref()
            .is_some_and(|written| written.start == open.start && written.tags == open.tags);
        if ours {
            self.refresh_open_expansion(&open)?;
        } else if self.last_written.is_none() && open.tags.contains(&self.markers.provenance) {
            self.last_written = Some(open);
        } else {
            tracing::info!(tags = %open.tags, "open interval was edited externally; entering manual mode");
            self.enter_manual(&open);
        }
        Ok(())
    }

    /// Feeds one resolved event. Events must arrive in timestamp order.
    pub fn process_event(
        &mut self,
        event: &Event,
        decision: &TagDecision,
    ) -> Result<(), EngineError> {
        // Window activity is evidence of presence. If no watcher signaled
        // the return, the event itself ends the absence.
        if self.state.presence() == PresenceState::Away {
            tracing::debug!(at = %event.timestamp, "window activity while away; resuming");
            self.state
                .set_presence(PresenceState::Active)
                .map_err(InvariantViolation::from)?;
            self.state.mark_known(event.timestamp)?;
        }
        let processed_before = self.state.processed_duration(event.timestamp);
        let increment = self.state.event_increment(event.timestamp, event.duration)?;
        self.state.observe(event.end());

        let tags = match decision {
            TagDecision::Ignored => {
                self.discard_run();
                self.state.note_ignored(increment);
                return Ok(());
            }
            TagDecision::NoMatch => {
                self.discard_run();
                self.state.note_unknown(increment);
                return Ok(());
            }
            TagDecision::Matched(tags) => tags,
        };

        let ignore = self.config.ignore_interval();
        let continues = self.short_run.as_ref().is_some_and(|run| {
            run.tags == *tags && event.timestamp <= run.last_end + ignore
        });
        if !continues {
            self.discard_run();
            self.short_run = Some(ShortRun {
                tags: tags.clone(),
                start: event.timestamp,
                last_end: event.end(),
                pending: TimeDelta::zero(),
            });
        }
        let Some(run) = self.short_run.as_mut() else {
            return Ok(());
        };
        run.last_end = run.last_end.max(event.end());
        run.pending += increment;

        // A single long event proves its context by itself; a run of short
        // ones has to accumulate enough wall-clock span first.
        let proven = event.duration >= ignore || run.last_end - run.start > ignore;
        if !proven {
            return Ok(());
        }
        let pending = std::mem::replace(&mut run.pending, TimeDelta::zero());
        self.state.accumulate(tags, pending)?;

        self.maybe_export(tags, event, processed_before)
    }

    /// Feeds one authoritative presence transition.
    pub fn process_presence(
        &mut self,
        next: PresenceState,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if self.state.presence() == next {
            return Ok(());
        }
        match next {
            PresenceState::Away => {
                self.discard_run();
                self.flush_accumulated(at)?;
                let mut away_tags = TagSet::default();
                away_tags.insert(self.markers.away.clone());
                away_tags.insert(self.markers.provenance.clone());
                self.ensure_open(&away_tags, at, at, &TagSet::default())?;
                self.state.set_presence(PresenceState::Away).map_err(InvariantViolation::from)?;
                self.state.record_away(at)?;
            }
            PresenceState::Active => {
                self.state.set_presence(PresenceState::Active).map_err(InvariantViolation::from)?;
                self.state.mark_known(at)?;
            }
            PresenceState::Unknown => {
                self.state.set_presence(PresenceState::Unknown).map_err(InvariantViolation::from)?;
            }
        }
        Ok(())
    }

    fn discard_run(&mut self) {
        if let Some(run) = self.short_run.take() {
            if run.pending > TimeDelta::zero() {
                self.state.note_ignored(run.pending);
            }
        }
    }

    fn maybe_export(
        &mut self,
        current: &TagSet,
        event: &Event,
        processed_before: TimeDelta,
    ) -> Result<(), EngineError> {
        let decision_end = event.end();

        // One context continuously active beyond the mixing bound exports
        // on its own, from the event's own start. Fires only on the first
        // crossing so a still-growing event does not re-export.
        let max_mixed = self.config.max_mixed_interval();
        if event.duration > max_mixed && processed_before <= max_mixed {
            let start = event.timestamp.max(self.state.last_start_time());
            let expansion = self.expander.expand(current);
            let retained = current.union(&expansion.tags);
            let mut write_set = expansion.tags;
            write_set.insert(self.markers.provenance.clone());
            return self.ensure_open(&write_set, start, decision_end, &retained);
        }

        let elapsed = decision_end - self.state.last_known_tick();
        if elapsed <= self.config.min_recording_interval() {
            return Ok(());
        }
        let min_tag = self.config.min_tag_recording_interval();
        if !self.state.tag_times().any(|(_, time)| time > min_tag) {
            return Ok(());
        }
        self.export_qualifying(decision_end)
    }

    /// Attempts an export of whatever qualifies right now, without the
    /// elapsed-time trigger. Used when absence cuts a context short.
    fn flush_accumulated(&mut self, at: DateTime<Utc>) -> Result<(), EngineError> {
        let min_tag = self.config.min_tag_recording_interval();
        if self.state.tag_times().any(|(_, time)| time >= min_tag) {
            self.export_qualifying(at)?;
        }
        Ok(())
    }

    fn export_qualifying(&mut self, decision_end: DateTime<Utc>) -> Result<(), EngineError> {
        let min_tag = self.config.min_tag_recording_interval();
        let qualifying: BTreeMap<Tag, TimeDelta> = self
            .state
            .tag_times()
            .filter(|(_, time)| *time >= min_tag)
            .map(|(tag, time)| (tag.clone(), time))
            .collect();
        let survivors = self.resolve_exclusive(&qualifying);
        if survivors.is_empty() {
            tracing::warn!(
                at = %decision_end,
                "export decision resolved to no tags; discarding accumulated time"
            );
            self.state.record_abort(decision_end)?;
            return Ok(());
        }

        let start = if self.state.manual_mode() {
            let back = decision_end - self.state.known_time();
            back.max(self.state.manual_since().unwrap_or(back))
        } else {
            self.state.last_known_tick()
        };

        let expansion = self.expander.expand(&survivors);
        let retained = survivors.union(&expansion.tags);
        let mut write_set = expansion.tags;
        write_set.insert(self.markers.provenance.clone());
        self.ensure_open(&write_set, start, decision_end, &retained)
    }

    /// Drops the losing members of every violated exclusive group.
    ///
    /// Within a group, tags with strictly less accumulated time than the
    /// group's qualifying maximum lose. An exact tie across all conflicting
    /// members keeps only the lexicographically smallest, so the decision
    /// is deterministic and the result never empties.
    fn resolve_exclusive(&self, qualifying: &BTreeMap<Tag, TimeDelta>) -> TagSet {
        let mut set: TagSet = qualifying.keys().cloned().collect();
        loop {
            let violations = self.expander.violations(&set);
            if violations.is_empty() {
                return set;
            }
            for violation in violations {
                let members: Vec<&Tag> = violation
                    .conflicting
                    .iter()
                    .filter(|tag| set.contains(tag))
                    .collect();
                if members.len() < 2 {
                    continue;
                }
                let Some(max_time) = members
                    .iter()
                    .filter_map(|tag| qualifying.get(*tag).copied())
                    .max()
                else {
                    continue;
                };
                let losers: Vec<Tag> = members
                    .iter()
                    .filter(|tag| {
                        qualifying.get(**tag).copied().unwrap_or_default() < max_time
                    })
                    .map(|tag| (*tag).clone())
                    .collect();
                if losers.is_empty() {
                    // All conflicting members tied exactly; smallest wins.
                    let mut sorted: Vec<&Tag> = members;
                    sorted.sort();
                    for tag in sorted.into_iter().skip(1) {
                        set.remove(tag);
                    }
                } else {
                    for tag in &losers {
                        set.remove(tag);
                    }
                }
            }
        }
    }

    /// The guarded write: opens `[start, ...)` with `tags` unless the open
    /// interval forbids it, and applies the post-export reset on success.
    fn ensure_open(
        &mut self,
        tags: &TagSet,
        start: DateTime<Utc>,
        decision_end: DateTime<Utc>,
        retained: &TagSet,
    ) -> Result<(), EngineError> {
        if let Some(open) = self.ledger.current_open_interval()? {
            if open.tags.contains(&self.markers.override_marker) {
                tracing::debug!(tags = %open.tags, "open interval is overridden; not touching it");
                return Ok(());
            }
            if tags.is_subset(&open.tags) {
                tracing::trace!(tags = %tags, "open interval already covers this; skipping write");
                return Ok(());
            }
        }
        let core = self.core_tags(tags);
        if let Some(violation) = self.expander.violations(&core).into_iter().next() {
            return Err(InvariantViolation::ExclusiveOverlap {
                group: violation.group,
                tags: violation.conflicting,
            }
            .into());
        }
        self.ledger.start(tags, start)?;
        self.last_written = Some(Interval::open(start, tags.clone()));
        self.state
            .record_export(start, decision_end, retained, self.config.stickiness_factor)?;
        Ok(())
    }

    fn enter_manual(&mut self, open: &Interval) {
        let seeds = self.core_tags(&open.tags);
        self.state.begin_manual(
            &seeds,
            self.config.min_tag_recording_interval(),
            open.start,
        );
        self.last_written = Some(open.clone());
    }

    /// Re-applies the current retag rules to our own open interval.
    fn refresh_open_expansion(&mut self, open: &Interval) -> Result<(), EngineError> {
        if open.tags.contains(&self.markers.override_marker) {
            return Ok(());
        }
        let core = self.core_tags(&open.tags);
        let mut expanded = self.expander.expand(&core).tags;
        for marker in [&self.markers.away, &self.markers.provenance] {
            if open.tags.contains(marker) {
                expanded.insert(marker.clone());
            }
        }
        if expanded != open.tags {
            tracing::debug!(from = %open.tags, to = %expanded, "refreshing open interval tags");
            self.ledger.retag(&expanded)?;
            self.last_written = Some(Interval::open(open.start, expanded));
        }
        Ok(())
    }

    /// Tags minus the engine's marker tags.
    fn core_tags(&self, tags: &TagSet) -> TagSet {
        let mut core = tags.clone();
        core.remove(&self.markers.away);
        core.remove(&self.markers.override_marker);
        core.remove(&self.markers.provenance);
        core
    }
}
