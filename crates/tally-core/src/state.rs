//! Accumulator state and its named transitions.
//!
//! All mutation of the accumulator goes through the methods here; the
//! engine never pokes fields directly. Every transition that moves a
//! timestamp re-checks the ordering invariant
//! `last_start_time <= last_known_tick <= last_tick` and fails loudly
//! instead of carrying a corrupted clock forward.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::event::{PresenceState, PresenceTransitionError};
use crate::types::{Tag, TagSet};

/// A broken accumulator invariant. Fatal for the current tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("time bounds violated: {which} ({earlier} must not exceed {later})")]
    TimeBounds {
        which: &'static str,
        earlier: DateTime<Utc>,
        later: DateTime<Utc>,
    },
    #[error("negative accumulated time for tag {tag}")]
    NegativeTagTime { tag: Tag },
    #[error("negative event duration at {at}")]
    NegativeDuration { at: DateTime<Utc> },
    #[error("exported set violates exclusive group {group}: {tags}")]
    ExclusiveOverlap { group: String, tags: TagSet },
    #[error(transparent)]
    Presence(#[from] PresenceTransitionError),
}

/// Tracks how much of a still-growing event has already been credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CurrentEvent {
    started: DateTime<Utc>,
    processed: TimeDelta,
}

/// Running totals between export decisions.
///
/// Owned by one engine instance. Reconstructed from the ledger's open
/// interval on restart rather than persisted on its own.
#[derive(Debug, Clone)]
pub struct AccumulatorState {
    tag_time: BTreeMap<Tag, TimeDelta>,
    known_time: TimeDelta,
    unknown_time: TimeDelta,
    ignored_time: TimeDelta,
    last_tick: DateTime<Utc>,
    last_known_tick: DateTime<Utc>,
    last_start_time: DateTime<Utc>,
    presence: PresenceState,
    manual_mode: bool,
    manual_since: Option<DateTime<Utc>>,
    current_event: Option<CurrentEvent>,
}

impl AccumulatorState {
    #[must_use]
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            tag_time: BTreeMap::new(),
            known_time: TimeDelta::zero(),
            unknown_time: TimeDelta::zero(),
            ignored_time: TimeDelta::zero(),
            last_tick: origin,
            last_known_tick: origin,
            last_start_time: origin,
            presence: PresenceState::Unknown,
            manual_mode: false,
            manual_since: None,
            current_event: None,
        }
    }

    pub fn tag_time(&self, tag: &Tag) -> TimeDelta {
        self.tag_time.get(tag).copied().unwrap_or_default()
    }

    pub fn tag_times(&self) -> impl Iterator<Item = (&Tag, TimeDelta)> {
        self.tag_time.iter().map(|(tag, time)| (tag, *time))
    }

    pub fn known_time(&self) -> TimeDelta {
        self.known_time
    }

    pub fn unknown_time(&self) -> TimeDelta {
        self.unknown_time
    }

    pub fn ignored_time(&self) -> TimeDelta {
        self.ignored_time
    }

    pub fn last_tick(&self) -> DateTime<Utc> {
        self.last_tick
    }

    pub fn last_known_tick(&self) -> DateTime<Utc> {
        self.last_known_tick
    }

    pub fn last_start_time(&self) -> DateTime<Utc> {
        self.last_start_time
    }

    pub fn presence(&self) -> PresenceState {
        self.presence
    }

    pub fn manual_mode(&self) -> bool {
        self.manual_mode
    }

    /// Start of the manually entered interval, while in manual mode.
    pub fn manual_since(&self) -> Option<DateTime<Utc>> {
        self.manual_since
    }

    /// Credit for an event, net of what was already processed.
    ///
    /// Live sources re-deliver the newest event as it grows; the event is
    /// identified by its start timestamp and only the unprocessed remainder
    /// is credited. Returns the increment to accumulate, never negative.
    pub fn event_increment(
        &mut self,
        timestamp: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Result<TimeDelta, InvariantViolation> {
        if duration < TimeDelta::zero() {
            return Err(InvariantViolation::NegativeDuration { at: timestamp });
        }
        let processed_before = match self.current_event {
            Some(current) if current.started == timestamp => current.processed,
            _ => TimeDelta::zero(),
        };
        self.current_event = Some(CurrentEvent {
            started: timestamp,
            processed: duration.max(processed_before),
        });
        Ok((duration - processed_before).max(TimeDelta::zero()))
    }

    /// How much of the event identified by `timestamp` was already credited.
    #[must_use]
    pub fn processed_duration(&self, timestamp: DateTime<Utc>) -> TimeDelta {
        match self.current_event {
            Some(current) if current.started == timestamp => current.processed,
            _ => TimeDelta::zero(),
        }
    }

    /// Marks time as processed up to `until`.
    pub fn observe(&mut self, until: DateTime<Utc>) {
        self.last_tick = self.last_tick.max(until);
    }

    /// Advances the known boundary.
    pub fn mark_known(&mut self, at: DateTime<Utc>) -> Result<(), InvariantViolation> {
        self.last_known_tick = self.last_known_tick.max(at);
        self.last_tick = self.last_tick.max(at);
        self.check_bounds()
    }

    /// Adds matched time to every tag in the set and to the known total.
    pub fn accumulate(
        &mut self,
        tags: &TagSet,
        amount: TimeDelta,
    ) -> Result<(), InvariantViolation> {
        if amount < TimeDelta::zero() {
            return Err(InvariantViolation::NegativeDuration {
                at: self.last_tick,
            });
        }
        for tag in tags {
            let entry = self.tag_time.entry(tag.clone()).or_default();
            *entry += amount;
        }
        self.known_time += amount;
        Ok(())
    }

    pub fn note_unknown(&mut self, amount: TimeDelta) {
        self.unknown_time += amount.max(TimeDelta::zero());
    }

    pub fn note_ignored(&mut self, amount: TimeDelta) {
        self.ignored_time += amount.max(TimeDelta::zero());
    }

    pub fn set_presence(
        &mut self,
        next: PresenceState,
    ) -> Result<PresenceState, PresenceTransitionError> {
        let previous = self.presence;
        self.presence = previous.transition_to(next)?;
        Ok(previous)
    }

    /// Enters manual mode: the open ledger interval was not ours.
    ///
    /// The accumulator restarts seeded with the manually observed tags so
    /// the next decision builds on the operator's entry instead of
    /// discarding it. Seeds count toward per-tag time only, not the known
    /// total, which must keep measuring observed time for start
    /// back-calculation.
    pub fn begin_manual(&mut self, seed_tags: &TagSet, seed: TimeDelta, since: DateTime<Utc>) {
        self.tag_time.clear();
        for tag in seed_tags {
            self.tag_time.insert(tag.clone(), seed);
        }
        self.known_time = TimeDelta::zero();
        self.unknown_time = TimeDelta::zero();
        self.ignored_time = TimeDelta::zero();
        self.manual_mode = true;
        self.manual_since = Some(since);
    }

    /// Applies the post-export reset: retained tags decay by the
    /// stickiness factor, everything else is dropped, totals restart and
    /// the clock advances to the exported boundary.
    pub fn record_export(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        retained: &TagSet,
        stickiness: f64,
    ) -> Result<(), InvariantViolation> {
        self.decay(retained, stickiness)?;
        self.reset_totals();
        self.last_start_time = start;
        self.last_known_tick = end;
        self.last_tick = self.last_tick.max(end);
        self.manual_mode = false;
        self.manual_since = None;
        self.check_bounds()
    }

    /// An export decision that resolved to no writable tags: nothing is
    /// written, but accumulated time is still discarded and the known
    /// boundary advances so the undecidable span is not re-claimed later.
    pub fn record_abort(&mut self, end: DateTime<Utc>) -> Result<(), InvariantViolation> {
        self.tag_time.clear();
        self.reset_totals();
        self.last_known_tick = self.last_known_tick.max(end);
        self.last_tick = self.last_tick.max(end);
        self.check_bounds()
    }

    /// Away entry: accumulated context does not survive an absence.
    pub fn record_away(&mut self, at: DateTime<Utc>) -> Result<(), InvariantViolation> {
        self.tag_time.clear();
        self.reset_totals();
        self.current_event = None;
        self.last_start_time = at;
        self.last_known_tick = at;
        self.last_tick = self.last_tick.max(at);
        self.manual_mode = false;
        self.manual_since = None;
        self.check_bounds()
    }

    /// Restart over an adopted or manual open interval.
    pub fn rewind_to(&mut self, start: DateTime<Utc>) {
        self.last_start_time = start;
        self.last_known_tick = start;
        self.last_tick = start;
    }

    fn decay(&mut self, retained: &TagSet, stickiness: f64) -> Result<(), InvariantViolation> {
        let mut decayed = BTreeMap::new();
        for (tag, time) in &self.tag_time {
            if !retained.contains(tag) {
                continue;
            }
            let millis = time.num_milliseconds();
            if millis < 0 {
                return Err(InvariantViolation::NegativeTagTime { tag: tag.clone() });
            }
            #[expect(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                reason = "durations are bounded well below f64 precision limits"
            )]
            let scaled = TimeDelta::milliseconds((millis as f64 * stickiness) as i64);
            if scaled > TimeDelta::zero() {
                decayed.insert(tag.clone(), scaled);
            }
        }
        self.tag_time = decayed;
        Ok(())
    }

    fn reset_totals(&mut self) {
        self.known_time = TimeDelta::zero();
        self.unknown_time = TimeDelta::zero();
        self.ignored_time = TimeDelta::zero();
    }

    fn check_bounds(&self) -> Result<(), InvariantViolation> {
        if self.last_start_time > self.last_known_tick {
            return Err(InvariantViolation::TimeBounds {
                which: "last_start_time > last_known_tick",
                earlier: self.last_start_time,
                later: self.last_known_tick,
            });
        }
        if self.last_known_tick > self.last_tick {
            return Err(InvariantViolation::TimeBounds {
                which: "last_known_tick > last_tick",
                earlier: self.last_known_tick,
                later: self.last_tick,
            });
        }
        Ok(())
    }
}
