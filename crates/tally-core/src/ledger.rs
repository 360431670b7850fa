//! The external interval ledger, seen from the engine's side.
//!
//! The ledger is a single mutable log of tagged intervals with one assumed
//! writer. The engine drives it through the [`Ledger`] trait; the in-memory
//! implementation backs batch derivation, tests, and the file-backed store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TagSet;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("no open interval")]
    NothingOpen,
    #[error("invalid range: {end} is not after {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether a bounded retry can plausibly help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// One tagged span. `end` of `None` means the interval is still open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub tags: TagSet,
}

impl Interval {
    #[must_use]
    pub const fn open(start: DateTime<Utc>, tags: TagSet) -> Self {
        Self {
            start,
            end: None,
            tags,
        }
    }

    #[must_use]
    pub const fn closed(start: DateTime<Utc>, end: DateTime<Utc>, tags: TagSet) -> Self {
        Self {
            start,
            end: Some(end),
            tags,
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Half-open overlap with `[start, end)`; touching endpoints do not
    /// overlap. An open interval extends indefinitely.
    #[must_use]
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && self.end.is_none_or(|own_end| start < own_end)
    }
}

/// A mutation issued against the ledger, as the engine expressed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Start { tags: TagSet, at: DateTime<Utc> },
    Stop { at: DateTime<Utc> },
    Retag { tags: TagSet },
    Track {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: TagSet,
    },
}

impl std::fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start { tags, at } => write!(f, "start {tags} at {at}"),
            Self::Stop { at } => write!(f, "stop at {at}"),
            Self::Retag { tags } => write!(f, "retag {tags}"),
            Self::Track { start, end, tags } => {
                write!(f, "track {start} - {end} {tags}")
            }
        }
    }
}

/// Sink and source of intervals.
///
/// All methods take `&mut self`: even reads may need to refresh a cache or
/// re-open a file, and there is a single writer by contract.
pub trait Ledger {
    fn current_open_interval(&mut self) -> Result<Option<Interval>, LedgerError>;

    /// Opens a new interval at `at`, closing any currently open one there.
    fn start(&mut self, tags: &TagSet, at: DateTime<Utc>) -> Result<(), LedgerError>;

    /// Closes the open interval at `at`. Errors when nothing is open.
    fn stop(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError>;

    /// Replaces the open interval's tags. Errors when nothing is open.
    fn retag(&mut self, tags: &TagSet) -> Result<(), LedgerError>;

    /// Idempotent historical upsert: makes `[start, end)` carry exactly
    /// `tags`, adjusting whatever was recorded there before.
    fn track(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &TagSet,
    ) -> Result<(), LedgerError>;

    /// Intervals overlapping `[start, end)`, ascending by start.
    fn intervals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Interval>, LedgerError>;
}

impl<L: Ledger + ?Sized> Ledger for &mut L {
    fn current_open_interval(&mut self) -> Result<Option<Interval>, LedgerError> {
        (**self).current_open_interval()
    }

    fn start(&mut self, tags: &TagSet, at: DateTime<Utc>) -> Result<(), LedgerError> {
        (**self).start(tags, at)
    }

    fn stop(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        (**self).stop(at)
    }

    fn retag(&mut self, tags: &TagSet) -> Result<(), LedgerError> {
        (**self).retag(tags)
    }

    fn track(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &TagSet,
    ) -> Result<(), LedgerError> {
        (**self).track(start, end, tags)
    }

    fn intervals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Interval>, LedgerError> {
        (**self).intervals(start, end)
    }
}

/// In-memory ledger: sorted intervals, at most one open, plus a journal of
/// the operations applied to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryLedger {
    intervals: Vec<Interval>,
    #[serde(skip)]
    ops: Vec<LedgerOp>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_intervals(mut intervals: Vec<Interval>) -> Self {
        intervals.sort_by_key(|interval| interval.start);
        Self {
            intervals,
            ops: Vec::new(),
        }
    }

    /// The journal of mutations applied since construction (or the last
    /// [`Self::clear_ops`] call).
    #[must_use]
    pub fn ops(&self) -> &[LedgerOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    #[must_use]
    pub fn all_intervals(&self) -> &[Interval] {
        &self.intervals
    }

    fn close_open(&mut self, at: DateTime<Utc>) {
        if let Some(position) = self.intervals.iter().position(Interval::is_open) {
            let open = &mut self.intervals[position];
            if at > open.start {
                open.end = Some(at);
            } else {
                // The open interval never materialized; a start at or
                // before its own start supersedes it.
                self.intervals.remove(position);
            }
        }
    }

    /// Removes `[start, end)` from recorded coverage, splitting intervals
    /// that straddle a boundary.
    fn carve(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut replaced = Vec::with_capacity(self.intervals.len() + 1);
        for interval in self.intervals.drain(..) {
            if !interval.overlaps(start, end) {
                replaced.push(interval);
                continue;
            }
            if interval.start < start {
                replaced.push(Interval::closed(
                    interval.start,
                    start,
                    interval.tags.clone(),
                ));
            }
            match interval.end {
                Some(own_end) if own_end > end => {
                    replaced.push(Interval::closed(end, own_end, interval.tags));
                }
                None => {
                    // Open interval with its head carved away.
                    replaced.push(Interval::open(end, interval.tags));
                }
                Some(_) => {}
            }
        }
        self.intervals = replaced;
    }

    fn insert_sorted(&mut self, interval: Interval) {
        let position = self
            .intervals
            .partition_point(|existing| existing.start <= interval.start);
        self.intervals.insert(position, interval);
    }
}

impl Ledger for MemoryLedger {
    fn current_open_interval(&mut self) -> Result<Option<Interval>, LedgerError> {
        Ok(self.intervals.iter().find(|i| i.is_open()).cloned())
    }

    fn start(&mut self, tags: &TagSet, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.close_open(at);
        self.insert_sorted(Interval::open(at, tags.clone()));
        self.ops.push(LedgerOp::Start {
            tags: tags.clone(),
            at,
        });
        Ok(())
    }

    fn stop(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if !self.intervals.iter().any(Interval::is_open) {
            return Err(LedgerError::NothingOpen);
        }
        self.close_open(at);
        self.ops.push(LedgerOp::Stop { at });
        Ok(())
    }

    fn retag(&mut self, tags: &TagSet) -> Result<(), LedgerError> {
        let open = self
            .intervals
            .iter_mut()
            .find(|i| i.is_open())
            .ok_or(LedgerError::NothingOpen)?;
        open.tags = tags.clone();
        self.ops.push(LedgerOp::Retag { tags: tags.clone() });
        Ok(())
    }

    fn track(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &TagSet,
    ) -> Result<(), LedgerError> {
        if end <= start {
            return Err(LedgerError::InvalidRange { start, end });
        }
        self.carve(start, end);
        self.insert_sorted(Interval::closed(start, end, tags.clone()));
        self.ops.push(LedgerOp::Track {
            start,
            end,
            tags: tags.clone(),
        });
        Ok(())
    }

    fn intervals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Interval>, LedgerError> {
        Ok(self
            .intervals
            .iter()
            .filter(|i| i.overlaps(start, end))
            .cloned()
            .collect())
    }
}

/// Wraps a ledger with bounded retry for transient failures.
///
/// Semantic errors (nothing open, invalid range) are surfaced immediately;
/// only transient ones are retried, then surfaced once attempts run out.
#[derive(Debug)]
pub struct RetryingLedger<L> {
    inner: L,
    attempts: u32,
    delay: Duration,
}

impl<L: Ledger> RetryingLedger<L> {
    pub fn new(inner: L, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    fn with_retry<T>(
        &mut self,
        what: &'static str,
        mut op: impl FnMut(&mut L) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut attempt = 1;
        loop {
            match op(&mut self.inner) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    tracing::warn!(error = %err, attempt, what, "ledger call failed; retrying");
                    attempt += 1;
                    std::thread::sleep(self.delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<L: Ledger> Ledger for RetryingLedger<L> {
    fn current_open_interval(&mut self) -> Result<Option<Interval>, LedgerError> {
        self.with_retry("current_open_interval", Ledger::current_open_interval)
    }

    fn start(&mut self, tags: &TagSet, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.with_retry("start", |ledger| ledger.start(tags, at))
    }

    fn stop(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.with_retry("stop", |ledger| ledger.stop(at))
    }

    fn retag(&mut self, tags: &TagSet) -> Result<(), LedgerError> {
        self.with_retry("retag", |ledger| ledger.retag(tags))
    }

    fn track(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &TagSet,
    ) -> Result<(), LedgerError> {
        self.with_retry("track", |ledger| ledger.track(start, end, tags))
    }

    fn intervals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Interval>, LedgerError> {
        self.with_retry("intervals", |ledger| ledger.intervals(start, end))
    }
}
