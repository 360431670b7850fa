//! Event-to-tag mapping boundary.

use crate::event::Event;
use crate::types::TagSet;

/// Outcome of resolving one event to tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagDecision {
    /// The event maps to this candidate tag set.
    Matched(TagSet),
    /// No rule matched; the event's time is known but unattributed.
    NoMatch,
    /// The event should not contribute time at all.
    Ignored,
}

impl TagDecision {
    #[must_use]
    pub const fn tags(&self) -> Option<&TagSet> {
        match self {
            Self::Matched(tags) => Some(tags),
            Self::NoMatch | Self::Ignored => None,
        }
    }
}

/// Maps one event to a candidate tag set.
pub trait TagResolver {
    fn resolve(&self, event: &Event) -> TagDecision;
}

impl<F: Fn(&Event) -> TagDecision> TagResolver for F {
    fn resolve(&self, event: &Event) -> TagDecision {
        self(event)
    }
}
