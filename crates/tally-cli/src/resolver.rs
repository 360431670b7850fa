//! Window event tagging from the configured application map.

use std::collections::BTreeMap;

use tally_core::types::ValidationError;
use tally_core::{Event, TagDecision, TagResolver, TagSet};

/// Resolves window events to tags by the `app` field of their payload.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    apps: BTreeMap<String, TagSet>,
}

impl MapResolver {
    /// Builds a resolver from configuration, validating every tag name.
    pub fn from_config(apps: &BTreeMap<String, Vec<String>>) -> Result<Self, ValidationError> {
        let mut resolved = BTreeMap::new();
        for (app, names) in apps {
            resolved.insert(app.clone(), TagSet::from_names(names.iter().cloned())?);
        }
        Ok(Self { apps: resolved })
    }
}

impl TagResolver for MapResolver {
    fn resolve(&self, event: &Event) -> TagDecision {
        let Some(app) = event.payload.get("app").and_then(serde_json::Value::as_str) else {
            return TagDecision::NoMatch;
        };
        match self.apps.get(app) {
            // An empty tag list marks the application as deliberately untracked.
            Some(tags) if tags.is_empty() => TagDecision::Ignored,
            Some(tags) => TagDecision::Matched(tags.clone()),
            None => TagDecision::NoMatch,
        }
    }
}
