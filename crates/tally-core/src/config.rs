//! Engine, presence, and rule configuration.
//!
//! Configuration is plain immutable data, validated once and injected into
//! each component at construction. Durations are whole seconds to keep the
//! TOML surface simple; accessors convert to [`TimeDelta`].

use std::collections::BTreeMap;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::PresenceSource;
use crate::types::{SourceId, Tag, ValidationError};

/// Configuration problems, reported by `validate`/`issues`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("stickiness_factor must be in [0, 1), got {value}")]
    StickinessOutOfRange { value: f64 },

    #[error("{field} must be positive")]
    NonPositiveDuration { field: &'static str },

    #[error(
        "min_tag_recording_interval_secs ({tag}) must not exceed min_recording_interval_secs ({recording})"
    )]
    ThresholdOrder { tag: u64, recording: u64 },

    #[error("{field} is not a usable tag: {source}")]
    InvalidTag {
        field: &'static str,
        source: ValidationError,
    },

    #[error("presence priority must list each source exactly once")]
    PresencePriority,

    #[error("presence source class {field} cannot be empty")]
    EmptySourceClass { field: &'static str },

    #[error("retag rule {name}: source_tags cannot be empty")]
    RuleWithoutSources { name: String },

    #[error("retag rule {name}: needs at least one of remove, replace, add")]
    RuleWithoutActions { name: String },

    #[error("retag rule {name}: empty tag template")]
    RuleEmptyTemplate { name: String },

    #[error("exclusive group {name} needs at least two tags")]
    ExclusiveGroupTooSmall { name: String },
}

/// Tuning for the accumulation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Events shorter than this are noise unless part of a same-context run.
    /// Default: 5.
    pub ignore_interval_secs: u64,

    /// Minimum elapsed time since the last export before a threshold export
    /// may fire. Default: 60.
    pub min_recording_interval_secs: u64,

    /// Accumulated time a tag needs before it qualifies for export.
    /// Default: 30.
    pub min_tag_recording_interval_secs: u64,

    /// A single context continuously active past this exports directly.
    /// Default: 180.
    pub max_mixed_interval_secs: u64,

    /// Decay multiplier applied to exported tags' accumulated time.
    /// Default: 0.25.
    pub stickiness_factor: f64,

    /// Iteration cap for the retag fixed-point loop. Default: 10.
    pub expansion_depth: u32,

    /// Attempts per collaborator call before the failure is surfaced.
    /// Default: 3.
    pub retry_attempts: u32,

    /// Delay between retry attempts, in milliseconds. Default: 500.
    pub retry_delay_ms: u64,

    /// Sleep between sync passes, in seconds. Default: 3.
    pub poll_interval_secs: u64,

    /// Tag on intervals covering away periods. Default: "away".
    pub away_tag: String,

    /// Marker tag that makes the open interval untouchable. Default: "override".
    pub override_tag: String,

    /// Marker tag the engine appends to everything it writes. Default: "~tally".
    pub provenance_tag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ignore_interval_secs: 5,
            min_recording_interval_secs: 60,
            min_tag_recording_interval_secs: 30,
            max_mixed_interval_secs: 180,
            stickiness_factor: 0.25,
            expansion_depth: 10,
            retry_attempts: 3,
            retry_delay_ms: 500,
            poll_interval_secs: 3,
            away_tag: "away".to_string(),
            override_tag: "override".to_string(),
            provenance_tag: "~tally".to_string(),
        }
    }
}

// Absurdly large values saturate instead of overflowing TimeDelta.
fn secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl EngineConfig {
    pub fn ignore_interval(&self) -> TimeDelta {
        secs(self.ignore_interval_secs)
    }

    pub fn min_recording_interval(&self) -> TimeDelta {
        secs(self.min_recording_interval_secs)
    }

    pub fn min_tag_recording_interval(&self) -> TimeDelta {
        secs(self.min_tag_recording_interval_secs)
    }

    pub fn max_mixed_interval(&self) -> TimeDelta {
        secs(self.max_mixed_interval_secs)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    /// Parses the three marker tags, validating them.
    pub fn markers(&self) -> Result<Markers, ConfigError> {
        let tag = |field, value: &str| {
            Tag::new(value).map_err(|source| ConfigError::InvalidTag { field, source })
        };
        Ok(Markers {
            away: tag("away_tag", &self.away_tag)?,
            override_marker: tag("override_tag", &self.override_tag)?,
            provenance: tag("provenance_tag", &self.provenance_tag)?,
        })
    }

    /// All problems with this configuration.
    pub fn issues(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();
        if !(0.0..1.0).contains(&self.stickiness_factor) {
            issues.push(ConfigError::StickinessOutOfRange {
                value: self.stickiness_factor,
            });
        }
        for (field, value) in [
            ("ignore_interval_secs", self.ignore_interval_secs),
            (
                "min_recording_interval_secs",
                self.min_recording_interval_secs,
            ),
            (
                "min_tag_recording_interval_secs",
                self.min_tag_recording_interval_secs,
            ),
            ("max_mixed_interval_secs", self.max_mixed_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
        ] {
            if value == 0 {
                issues.push(ConfigError::NonPositiveDuration { field });
            }
        }
        if self.min_tag_recording_interval_secs > self.min_recording_interval_secs {
            issues.push(ConfigError::ThresholdOrder {
                tag: self.min_tag_recording_interval_secs,
                recording: self.min_recording_interval_secs,
            });
        }
        if self.expansion_depth == 0 {
            issues.push(ConfigError::NonPositiveDuration {
                field: "expansion_depth",
            });
        }
        if let Err(issue) = self.markers() {
            issues.push(issue);
        }
        issues
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.issues().into_iter().next().map_or(Ok(()), Err)
    }
}

/// The engine's marker tags, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub away: Tag,
    pub override_marker: Tag,
    pub provenance: Tag,
}

/// Tuning for presence-signal adaptation and conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresenceConfig {
    /// Fill reporting gaps in the user-idle timeline with synthetic away
    /// segments. Default: true.
    pub gap_fill: bool,

    /// Minimum gap that gets filled, in seconds. Default: 90.
    pub gap_fill_min_secs: u64,

    /// Presence segments not exceeding this are flap noise. Default: 240.
    pub min_segment_secs: u64,

    /// Lid/suspend segments not exceeding this are dropped unless they mark
    /// a boot gap. Default: 10.
    pub min_lid_segment_secs: u64,

    /// Source priority for conflict resolution, highest first.
    /// Default: lid-suspend, user-idle.
    pub priority: Vec<PresenceSource>,

    /// Source ids adapted as user-idle watchers. Default: "user-idle".
    pub user_idle_sources: Vec<String>,

    /// Source ids adapted as lid/suspend watchers. Default: "lid".
    pub lid_sources: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            gap_fill: true,
            gap_fill_min_secs: 90,
            min_segment_secs: 240,
            min_lid_segment_secs: 10,
            priority: vec![PresenceSource::LidSuspend, PresenceSource::UserIdle],
            user_idle_sources: vec!["user-idle".to_string()],
            lid_sources: vec!["lid".to_string()],
        }
    }
}

impl PresenceConfig {
    pub fn gap_fill_min(&self) -> TimeDelta {
        secs(self.gap_fill_min_secs)
    }

    pub fn min_segment(&self) -> TimeDelta {
        secs(self.min_segment_secs)
    }

    pub fn min_lid_segment(&self) -> TimeDelta {
        secs(self.min_lid_segment_secs)
    }

    /// Which presence class a source id belongs to, if any.
    pub fn classify(&self, source: &SourceId) -> Option<PresenceSource> {
        if self.user_idle_sources.iter().any(|s| s == source.as_str()) {
            return Some(PresenceSource::UserIdle);
        }
        if self.lid_sources.iter().any(|s| s == source.as_str()) {
            return Some(PresenceSource::LidSuspend);
        }
        None
    }

    /// Priority rank of a source; lower ranks outrank higher ones.
    pub fn rank(&self, source: PresenceSource) -> usize {
        self.priority
            .iter()
            .position(|&p| p == source)
            .unwrap_or(self.priority.len())
    }

    pub fn issues(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();
        let mut seen = Vec::new();
        for &source in &self.priority {
            if seen.contains(&source) {
                issues.push(ConfigError::PresencePriority);
                break;
            }
            seen.push(source);
        }
        if self.priority.is_empty() {
            issues.push(ConfigError::PresencePriority);
        }
        if self.gap_fill && self.gap_fill_min_secs == 0 {
            issues.push(ConfigError::NonPositiveDuration {
                field: "gap_fill_min_secs",
            });
        }
        if self.user_idle_sources.is_empty() {
            issues.push(ConfigError::EmptySourceClass {
                field: "user_idle_sources",
            });
        }
        issues
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.issues().into_iter().next().map_or(Ok(()), Err)
    }
}

/// One retag rule: fires when `source_tags` intersect the working set.
///
/// Steps apply in order: `remove`, then `replace` (drops the matched source
/// tags), then `add`. Templates may contain `$source_tag`, instantiated once
/// per matched source tag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetagRule {
    pub source_tags: Vec<String>,
    pub remove: Vec<String>,
    pub replace: Vec<String>,
    pub add: Vec<String>,
}

impl RetagRule {
    fn has_actions(&self) -> bool {
        !(self.remove.is_empty() && self.replace.is_empty() && self.add.is_empty())
    }
}

/// A named group of mutually exclusive tags.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExclusiveGroup {
    pub tags: Vec<String>,
}

/// Retag rules plus exclusive groups, keyed by section name.
///
/// `BTreeMap` keys give rules a deterministic application order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleSet {
    pub tags: BTreeMap<String, RetagRule>,
    pub exclusive: BTreeMap<String, ExclusiveGroup>,
}

impl RuleSet {
    pub fn issues(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();
        for (name, rule) in &self.tags {
            if rule.source_tags.is_empty() {
                issues.push(ConfigError::RuleWithoutSources { name: name.clone() });
            }
            if !rule.has_actions() {
                issues.push(ConfigError::RuleWithoutActions { name: name.clone() });
            }
            let all = rule
                .source_tags
                .iter()
                .chain(&rule.remove)
                .chain(&rule.replace)
                .chain(&rule.add);
            for template in all {
                if template.is_empty() {
                    issues.push(ConfigError::RuleEmptyTemplate { name: name.clone() });
                    break;
                }
            }
        }
        for (name, group) in &self.exclusive {
            if group.tags.len() < 2 {
                issues.push(ConfigError::ExclusiveGroupTooSmall { name: name.clone() });
            }
        }
        issues
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.issues().into_iter().next().map_or(Ok(()), Err)
    }
}
