//! Core engine for reducing watcher event streams to tagged intervals.
//!
//! This crate contains the fundamental types and logic for:
//! - Accumulation: crediting event time to tags and exporting intervals
//! - Presence: adapting and resolving competing absence assertions
//! - Rules: tag expansion and exclusive-group enforcement
//! - Reconciliation: comparing a derived timeline against the ledger

pub mod accumulate;
pub mod config;
pub mod conflict;
pub mod event;
pub mod expand;
pub mod ledger;
pub mod reconcile;
pub mod resolver;
pub mod runner;
pub mod source;
mod state;
pub mod types;

pub use accumulate::{AccumulationEngine, EngineError};
pub use config::{ConfigError, EngineConfig, PresenceConfig, RuleSet};
pub use conflict::{ConflictResolver, ResolvedTimeline};
pub use event::{Event, EventKind, PresenceState};
pub use expand::TagExpander;
pub use ledger::{Interval, Ledger, LedgerError, MemoryLedger, RetryingLedger};
pub use reconcile::{OverlapCategory, ReconciliationEngine, ReconciliationReport};
pub use resolver::{TagDecision, TagResolver};
pub use runner::{PassSummary, Pipeline, RunnerError};
pub use source::{EventSource, MemorySource, SourceError};
pub use state::{AccumulatorState, InvariantViolation};
pub use types::{EventId, SourceId, Tag, TagSet};
