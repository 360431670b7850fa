//! Event supply boundary.

use chrono::{DateTime, Utc};

use crate::event::{Event, EventKind};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("event source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed event: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Whether a bounded retry can plausibly help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Supplies events intersecting a half-open time window.
///
/// Implementations return events whose `[timestamp, timestamp + duration)`
/// span intersects `[start, end)`, in ascending timestamp order. A
/// zero-duration event counts when its timestamp lies inside the window.
pub trait EventSource {
    fn list_events(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, SourceError>;
}

impl<S: EventSource + ?Sized> EventSource for &S {
    fn list_events(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, SourceError> {
        (**self).list_events(kind, start, end)
    }
}

fn intersects(event: &Event, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    event.timestamp < end && (event.end() > start || event.timestamp >= start)
}

/// Fixed event list, mainly for tests and replay.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    events: Vec<Event>,
}

impl MemorySource {
    #[must_use]
    pub fn new(mut events: Vec<Event>) -> Self {
        events.sort_by_key(|event| event.timestamp);
        Self { events }
    }

    pub fn push(&mut self, event: Event) {
        let position = self
            .events
            .partition_point(|existing| existing.timestamp <= event.timestamp);
        self.events.insert(position, event);
    }
}

impl EventSource for MemorySource {
    fn list_events(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, SourceError> {
        Ok(self
            .events
            .iter()
            .filter(|event| event.kind == kind && intersects(event, start, end))
            .cloned()
            .collect())
    }
}
