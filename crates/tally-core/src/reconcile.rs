//! Reconciliation of derived intervals against the ledger.
//!
//! Runs over a closed window: the derived timeline comes from a batch
//! engine pass, the ledger timeline from the ledger itself. Every unit of
//! overlap is classified; gaps and stale intervals of our own making yield
//! `track` corrections that converge: applying them all and re-running
//! reconciliation produces nothing further.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{ConfigError, EngineConfig, Markers, RuleSet};
use crate::expand::TagExpander;
use crate::ledger::{Interval, Ledger, LedgerError};
use crate::types::TagSet;

/// Corrections and missing-coverage rows below this are sub-resolution
/// artifacts of boundary arithmetic, not real discrepancies.
const MIN_CORRECTION_SECS: i64 = 1;

/// How a unit of overlap between the two timelines compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapCategory {
    /// Normalized tag sets are equal.
    Matching,
    /// Both sides cover the range but the normalized sets differ.
    DifferentTags,
    /// Derived coverage with no ledger interval underneath.
    Missing,
    /// Ledger coverage with no derived counterpart.
    Extra,
    /// Ledger coverage we wrote in an earlier run that no longer matches
    /// anything derived. Distinct from [`Extra`](Self::Extra): it is a
    /// stale artifact, not a manual entry.
    PreviouslySynced,
}

impl OverlapCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Matching => "matching",
            Self::DifferentTags => "different-tags",
            Self::Missing => "missing",
            Self::Extra => "extra",
            Self::PreviouslySynced => "previously-synced",
        }
    }
}

impl fmt::Display for OverlapCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One classified unit of overlap.
///
/// Tag sets are normalized: marker tags stripped, retag rules applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub category: OverlapCategory,
    pub ledger_tags: TagSet,
    pub derived_tags: TagSet,
}

impl ReconciliationRow {
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Tags the ledger has that the derived timeline lacks.
    #[must_use]
    pub fn ledger_only(&self) -> TagSet {
        self.ledger_tags.difference(&self.derived_tags)
    }

    /// Tags the derived timeline has that the ledger lacks.
    #[must_use]
    pub fn derived_only(&self) -> TagSet {
        self.derived_tags.difference(&self.ledger_tags)
    }

    #[must_use]
    pub fn common(&self) -> TagSet {
        self.ledger_tags.intersection(&self.derived_tags)
    }
}

/// An idempotent adjustment: upsert `[start, end)` to carry exactly `tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tags: TagSet,
}

/// Classified overlap rows plus the corrections that would converge them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub rows: Vec<ReconciliationRow>,
    pub corrections: Vec<Correction>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.corrections.is_empty()
    }

    /// Row counts per category, in display order.
    #[must_use]
    pub fn tally(&self) -> Vec<(OverlapCategory, usize)> {
        let categories = [
            OverlapCategory::Matching,
            OverlapCategory::DifferentTags,
            OverlapCategory::Missing,
            OverlapCategory::Extra,
            OverlapCategory::PreviouslySynced,
        ];
        categories
            .into_iter()
            .map(|category| {
                let count = self.rows.iter().filter(|row| row.category == category).count();
                (category, count)
            })
            .collect()
    }
}

/// Interval-overlap classification and convergent correction generation.
pub struct ReconciliationEngine {
    expander: TagExpander,
    markers: Markers,
}

impl ReconciliationEngine {
    pub fn new(config: &EngineConfig, rules: &RuleSet) -> Result<Self, ConfigError> {
        Ok(Self {
            expander: TagExpander::new(rules, config.expansion_depth)?,
            markers: config.markers()?,
        })
    }

    /// Compares the two timelines and classifies every unit of overlap.
    ///
    /// Open intervals on either side are skipped; only a closed window can
    /// be compared. Consecutive same-tag derived intervals are merged
    /// first so one real span does not produce several rows.
    #[must_use]
    pub fn reconcile(&self, derived: &[Interval], ledger: &[Interval]) -> ReconciliationReport {
        let derived = merge_consecutive(derived);
        let mut ledger: Vec<&Interval> = ledger.iter().filter(|i| !i.is_open()).collect();
        ledger.sort_by_key(|i| i.start);

        let mut bounds: Vec<DateTime<Utc>> = Vec::new();
        for interval in derived.iter().chain(ledger.iter().copied()) {
            bounds.push(interval.start);
            if let Some(end) = interval.end {
                bounds.push(end);
            }
        }
        bounds.sort_unstable();
        bounds.dedup();

        let min_span = TimeDelta::seconds(MIN_CORRECTION_SECS);
        let mut report = ReconciliationReport::default();
        for pair in bounds.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            let covering = |interval: &&Interval| {
                interval.start <= lo && interval.end.is_some_and(|end| lo < end)
            };
            let derived_here = derived.iter().find(|i| covering(i));
            let ledger_here = ledger.iter().copied().find(|i| covering(i));
            match (derived_here, ledger_here) {
                (Some(d), Some(l)) => self.classify_overlap(&mut report, lo, hi, d, l, min_span),
                (Some(d), None) => {
                    // A hole in the ledger under derived coverage.
                    if hi - lo < min_span {
                        continue;
                    }
                    let tags = self.normalize(&d.tags);
                    report.corrections.push(Correction {
                        start: lo,
                        end: hi,
                        tags: self.stamp(&tags),
                    });
                    report.rows.push(ReconciliationRow {
                        start: lo,
                        end: hi,
                        category: OverlapCategory::Missing,
                        ledger_tags: TagSet::new(),
                        derived_tags: tags,
                    });
                }
                (None, Some(l)) => {
                    let category = if l.tags.contains(&self.markers.provenance) {
                        OverlapCategory::PreviouslySynced
                    } else {
                        OverlapCategory::Extra
                    };
                    report.rows.push(ReconciliationRow {
                        start: lo,
                        end: hi,
                        category,
                        ledger_tags: self.normalize(&l.tags),
                        derived_tags: TagSet::new(),
                    });
                }
                (None, None) => {}
            }
        }
        report
    }

    fn classify_overlap(
        &self,
        report: &mut ReconciliationReport,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
        derived: &Interval,
        ledger: &Interval,
        min_span: TimeDelta,
    ) {
        let derived_tags = self.normalize(&derived.tags);
        let ledger_tags = self.normalize(&ledger.tags);
        if derived_tags == ledger_tags {
            report.rows.push(ReconciliationRow {
                start: lo,
                end: hi,
                category: OverlapCategory::Matching,
                ledger_tags,
                derived_tags,
            });
            return;
        }
        // Our own stale interval converges toward the derived tags; a
        // manual entry is only ever reported.
        if ledger.tags.contains(&self.markers.provenance) && hi - lo >= min_span {
            report.corrections.push(Correction {
                start: lo,
                end: hi,
                tags: self.stamp(&derived_tags),
            });
        }
        report.rows.push(ReconciliationRow {
            start: lo,
            end: hi,
            category: OverlapCategory::DifferentTags,
            ledger_tags,
            derived_tags,
        });
    }

    /// Bookkeeping markers stripped, retag rules applied to a fixed point.
    ///
    /// The away tag survives normalization: it classifies the time itself,
    /// unlike the provenance and override markers.
    fn normalize(&self, tags: &TagSet) -> TagSet {
        let mut core = tags.clone();
        core.remove(&self.markers.override_marker);
        core.remove(&self.markers.provenance);
        self.expander.expand(&core).tags
    }

    /// Adds our provenance so a later run recognizes the write as ours.
    fn stamp(&self, tags: &TagSet) -> TagSet {
        let mut stamped = tags.clone();
        stamped.insert(self.markers.provenance.clone());
        stamped
    }
}

/// Merges closed, touching, same-tag intervals into single spans.
#[must_use]
pub fn merge_consecutive(intervals: &[Interval]) -> Vec<Interval> {
    let mut sorted: Vec<&Interval> = intervals.iter().filter(|i| !i.is_open()).collect();
    sorted.sort_by_key(|i| i.start);
    let mut merged: Vec<Interval> = Vec::new();
    for interval in sorted {
        if let Some(last) = merged.last_mut() {
            if last.tags == interval.tags && last.end == Some(interval.start) {
                last.end = interval.end;
                continue;
            }
        }
        merged.push(interval.clone());
    }
    merged
}

/// Executes corrections one at a time; a failure never blocks the rest.
pub fn apply_corrections<L: Ledger>(
    ledger: &mut L,
    corrections: &[Correction],
) -> Vec<(Correction, Result<(), LedgerError>)> {
    corrections
        .iter()
        .map(|correction| {
            let result = ledger.track(correction.start, correction.end, &correction.tags);
            if let Err(error) = &result {
                tracing::warn!(
                    start = %correction.start,
                    end = %correction.end,
                    error = %error,
                    "correction failed; continuing with the rest"
                );
            }
            (correction.clone(), result)
        })
        .collect()
}
