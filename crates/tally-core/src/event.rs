//! Events and presence signals as produced by event sources.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{EventId, SourceId};

/// Canonical event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Foreground window/application activity.
    Window,
    /// Presence assertion (user-idle or lid/suspend watcher).
    Presence,
    /// Auxiliary detail events (browser/editor sub-activity).
    Detail,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Presence => "presence",
            Self::Detail => "detail",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "window" => Ok(Self::Window),
            "presence" | "afk" => Ok(Self::Presence),
            "detail" => Ok(Self::Detail),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown event kind strings.
#[derive(Debug, Clone)]
pub struct UnknownEventKind(String);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event kind: {}", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}

/// One immutable observation from a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub duration: TimeDelta,
    pub kind: EventKind,
    pub source: SourceId,
    pub payload: serde_json::Value,
}

impl Event {
    /// Exclusive end of the event's range.
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp + self.duration
    }
}

/// Presence of the user as asserted by a watcher or held by the engine.
///
/// `Unknown` is only valid as an initial state; no transition may return to
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceState {
    Unknown,
    Active,
    Away,
}

impl PresenceState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Away => "away",
        }
    }

    /// Validates a transition, returning the new state.
    pub fn transition_to(self, next: Self) -> Result<Self, PresenceTransitionError> {
        if next == Self::Unknown {
            return Err(PresenceTransitionError { from: self });
        }
        Ok(next)
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PresenceState {
    type Err = UnknownPresenceState;

    // Wire payloads only ever carry the two observed states.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "away" => Ok(Self::Away),
            _ => Err(UnknownPresenceState(s.to_string())),
        }
    }
}

/// Error type for an attempted transition back to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceTransitionError {
    pub from: PresenceState,
}

impl fmt::Display for PresenceTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot transition from {} to unknown; unknown is only an initial state",
            self.from
        )
    }
}

impl std::error::Error for PresenceTransitionError {}

/// Error type for unknown presence payload values.
#[derive(Debug, Clone)]
pub struct UnknownPresenceState(String);

impl fmt::Display for UnknownPresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown presence state: {}", self.0)
    }
}

impl std::error::Error for UnknownPresenceState {}

/// Class of watcher a presence segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceSource {
    UserIdle,
    LidSuspend,
}

impl PresenceSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserIdle => "user-idle",
            Self::LidSuspend => "lid-suspend",
        }
    }
}

impl fmt::Display for PresenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One contiguous presence assertion from a single source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: PresenceState,
    pub source: PresenceSource,
}

impl PresenceSegment {
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Half-open range overlap; touching endpoints do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}
