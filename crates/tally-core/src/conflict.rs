//! Presence conflict resolution.
//!
//! Several watchers assert presence over overlapping ranges and they do
//! not always agree. This module adapts raw presence events into
//! segments, repairs watcher-specific artifacts (coverage gaps while the
//! device was off, flapping idle detection, spurious short lid events),
//! trims genuinely contradictory claims by source priority, and merges
//! what survives into one authoritative timeline. Window events are then
//! split at every timeline boundary so no event straddles an
//! active/away transition.

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{ConfigError, PresenceConfig};
use crate::event::{Event, PresenceSegment, PresenceSource, PresenceState};

/// Merged presence timeline plus window events split at its boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTimeline {
    /// Non-overlapping, ascending by start. Coverage gaps are allowed;
    /// consumers carry the previous state across them.
    pub presence: Vec<PresenceSegment>,
    /// Window events cut at presence boundaries, with the portions that
    /// fall inside away spans removed.
    pub windows: Vec<Event>,
}

/// Resolves competing presence assertions into one timeline.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    config: PresenceConfig,
}

impl ConflictResolver {
    pub fn new(config: PresenceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Runs the full pipeline over raw presence and window events.
    #[must_use]
    pub fn resolve(&self, presence_events: &[Event], window_events: &[Event]) -> ResolvedTimeline {
        let mut segments = self.adapt(presence_events);
        self.fill_idle_gaps(&mut segments);
        self.suppress_flaps(&mut segments);
        let trimmed = self.trim_conflicts(segments);
        let presence = self.sweep(&trimmed);
        let windows = split_windows(window_events, &presence);
        ResolvedTimeline { presence, windows }
    }

    /// Classifies raw events into presence segments, per source.
    fn adapt(&self, events: &[Event]) -> Vec<PresenceSegment> {
        let mut segments = Vec::with_capacity(events.len());
        for event in events {
            let Some(source) = self.config.classify(&event.source) else {
                tracing::debug!(source = %event.source, "unrecognized presence source");
                continue;
            };
            if event.duration <= TimeDelta::zero() {
                continue;
            }
            let state = match source {
                PresenceSource::UserIdle => {
                    let raw_state = event
                        .payload
                        .get("state")
                        .and_then(serde_json::Value::as_str);
                    let Some(raw_state) = raw_state else {
                        tracing::warn!(id = %event.id, "presence event without a state field");
                        continue;
                    };
                    match raw_state.parse::<PresenceState>() {
                        Ok(state) => state,
                        Err(err) => {
                            tracing::warn!(id = %event.id, error = %err, "skipping presence event");
                            continue;
                        }
                    }
                }
                PresenceSource::LidSuspend => {
                    // Short open/close cycles are sampling noise either way;
                    // only a boot gap is trustworthy at any length.
                    if event.duration <= self.config.min_lid_segment()
                        && !lid_boot_gap(&event.payload)
                    {
                        continue;
                    }
                    if lid_asserts_away(&event.payload) {
                        PresenceState::Away
                    } else {
                        PresenceState::Active
                    }
                }
            };
            segments.push(PresenceSegment {
                start: event.timestamp,
                end: event.end(),
                state,
                source,
            });
        }
        segments.sort_by_key(|segment| segment.start);
        segments
    }

    /// The idle watcher goes silent while the device is off or asleep;
    /// a large enough hole in its coverage is itself an away assertion.
    fn fill_idle_gaps(&self, segments: &mut Vec<PresenceSegment>) {
        if !self.config.gap_fill {
            return;
        }
        let idle: Vec<(DateTime<Utc>, DateTime<Utc>)> = segments
            .iter()
            .filter(|segment| segment.source == PresenceSource::UserIdle)
            .map(|segment| (segment.start, segment.end))
            .collect();
        let mut synthetic = Vec::new();
        let mut covered_until: Option<DateTime<Utc>> = None;
        for (start, end) in idle {
            if let Some(until) = covered_until {
                if start - until >= self.config.gap_fill_min() {
                    synthetic.push(PresenceSegment {
                        start: until,
                        end: start,
                        state: PresenceState::Away,
                        source: PresenceSource::UserIdle,
                    });
                }
            }
            covered_until = Some(covered_until.map_or(end, |until| until.max(end)));
        }
        segments.extend(synthetic);
        segments.sort_by_key(|segment| segment.start);
    }

    /// Drops short idle-watcher segments of either state. A sub-threshold
    /// away blip would fragment real activity; a sub-threshold active blip
    /// would cut a real absence in two. Surviving neighbors bridge the
    /// resulting hole during the sweep.
    fn suppress_flaps(&self, segments: &mut Vec<PresenceSegment>) {
        let min = self.config.min_segment();
        segments.retain(|segment| {
            segment.source != PresenceSource::UserIdle || segment.duration() > min
        });
    }

    /// Trims mutually-exclusive claims by priority.
    ///
    /// Only a lower-priority active claim against a higher-priority away
    /// claim is contradictory (the device cannot be in use while closed or
    /// suspended). An away assertion inside someone else's active range
    /// merely refines it and both survive.
    fn trim_conflicts(&self, segments: Vec<PresenceSegment>) -> Vec<PresenceSegment> {
        let away: Vec<PresenceSegment> = segments
            .iter()
            .filter(|segment| segment.state == PresenceState::Away)
            .cloned()
            .collect();
        let mut result = Vec::with_capacity(segments.len());
        for segment in segments {
            if segment.state == PresenceState::Away {
                result.push(segment);
                continue;
            }
            let holes: Vec<(DateTime<Utc>, DateTime<Utc>)> = away
                .iter()
                .filter(|other| {
                    self.config.rank(other.source) < self.config.rank(segment.source)
                        && other.overlaps(&segment)
                })
                .map(|other| (other.start, other.end))
                .collect();
            result.extend(subtract(&segment, &holes));
        }
        result.sort_by_key(|segment| segment.start);
        result
    }

    /// Merges surviving segments into one non-overlapping timeline.
    /// Wherever any source still asserts away, the merged state is away.
    fn sweep(&self, segments: &[PresenceSegment]) -> Vec<PresenceSegment> {
        let mut bounds: Vec<DateTime<Utc>> = segments
            .iter()
            .flat_map(|segment| [segment.start, segment.end])
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut merged: Vec<PresenceSegment> = Vec::new();
        for pair in bounds.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            let covering = segments
                .iter()
                .filter(|segment| segment.start < hi && segment.end > lo);
            let mut state: Option<(PresenceState, PresenceSource)> = None;
            for segment in covering {
                let candidate = (segment.state, segment.source);
                state = Some(match state {
                    None => candidate,
                    Some(current) => pick_winner(current, candidate, &self.config),
                });
            }
            let Some((state, source)) = state else {
                continue;
            };
            // Same-state spans bridge over coverage holes; consumers carry
            // the previous state across a hole, so nothing observable
            // changes and the timeline stays compact.
            match merged.last_mut() {
                Some(last) if last.state == state => {
                    last.end = hi;
                }
                _ => merged.push(PresenceSegment {
                    start: lo,
                    end: hi,
                    state,
                    source,
                }),
            }
        }
        merged
    }
}

fn pick_winner(
    current: (PresenceState, PresenceSource),
    candidate: (PresenceState, PresenceSource),
    config: &PresenceConfig,
) -> (PresenceState, PresenceSource) {
    match (current.0, candidate.0) {
        (PresenceState::Away, PresenceState::Active) => current,
        (PresenceState::Active, PresenceState::Away) => candidate,
        _ => {
            if config.rank(candidate.1) < config.rank(current.1) {
                candidate
            } else {
                current
            }
        }
    }
}

/// Removes `holes` from a segment, leaving zero or more residuals.
fn subtract(
    segment: &PresenceSegment,
    holes: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<PresenceSegment> {
    let mut sorted = holes.to_vec();
    sorted.sort_unstable();
    let mut residuals = Vec::new();
    let mut cursor = segment.start;
    for (hole_start, hole_end) in sorted {
        if hole_end <= cursor || hole_start >= segment.end {
            continue;
        }
        if hole_start > cursor {
            residuals.push(PresenceSegment {
                start: cursor,
                end: hole_start,
                ..*segment
            });
        }
        cursor = cursor.max(hole_end);
        if cursor >= segment.end {
            return residuals;
        }
    }
    if cursor < segment.end {
        residuals.push(PresenceSegment {
            start: cursor,
            end: segment.end,
            ..*segment
        });
    }
    residuals
}

/// Lid/suspend payloads carry separate fields rather than one state.
/// Closed, suspended, or a boot gap all assert the device is away.
fn lid_asserts_away(payload: &serde_json::Value) -> bool {
    payload.get("lid_state").and_then(serde_json::Value::as_str) == Some("closed")
        || payload.get("suspend_state").and_then(serde_json::Value::as_str) == Some("suspended")
        || lid_boot_gap(payload)
}

/// The synthetic event covering the blind spot between shutdown and boot.
fn lid_boot_gap(payload: &serde_json::Value) -> bool {
    payload
        .get("boot_gap")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Splits window events at presence boundaries and drops the portions
/// inside away spans: a focused window reported while the user is away
/// is stale, not activity.
fn split_windows(windows: &[Event], presence: &[PresenceSegment]) -> Vec<Event> {
    let mut bounds: Vec<DateTime<Utc>> = presence
        .iter()
        .flat_map(|segment| [segment.start, segment.end])
        .collect();
    bounds.sort_unstable();
    bounds.dedup();

    let away: Vec<(DateTime<Utc>, DateTime<Utc>)> = presence
        .iter()
        .filter(|segment| segment.state == PresenceState::Away)
        .map(|segment| (segment.start, segment.end))
        .collect();

    let mut result = Vec::with_capacity(windows.len());
    for event in windows {
        let event_end = event.end();
        let mut cursor = event.timestamp;
        let interior = bounds
            .iter()
            .copied()
            .filter(move |bound| *bound > cursor && *bound < event_end)
            .chain(std::iter::once(event_end));
        for bound in interior {
            if bound > cursor {
                let covered_by_away = away
                    .iter()
                    .any(|(away_start, away_end)| *away_start <= cursor && bound <= *away_end);
                if !covered_by_away {
                    let mut piece = event.clone();
                    piece.timestamp = cursor;
                    piece.duration = bound - cursor;
                    result.push(piece);
                }
            }
            cursor = bound;
        }
    }
    result.sort_by_key(|event| event.timestamp);
    result
}
