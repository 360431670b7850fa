//! Retag-rule expansion and exclusive-group checking.
//!
//! Expansion applies the configured rules to a tag set until it stops
//! changing. The loop is explicitly bounded: an iteration cap plus cycle
//! detection on the hash of each intermediate set. Non-convergence is
//! recoverable; callers get the last stable set and a flag.

use std::collections::HashSet;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::config::{ConfigError, RetagRule, RuleSet};
use crate::types::{Tag, TagSet};

const SOURCE_TAG_VAR: &str = "$source_tag";

/// Two or more tags from one exclusive group in the same set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveViolation {
    pub group: String,
    pub group_tags: TagSet,
    pub conflicting: TagSet,
}

impl fmt::Display for ExclusiveViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exclusive group {}: {} cannot appear together",
            self.group, self.conflicting
        )
    }
}

/// Result of expanding a tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub tags: TagSet,
    /// False when the iteration cap or a cycle cut the loop short.
    pub converged: bool,
}

#[derive(Debug, Clone)]
enum Template {
    Literal(Tag),
    /// Raw template containing `$source_tag`, instantiated per matched tag.
    PerSource(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    source_tags: TagSet,
    remove: Vec<Template>,
    replace: Vec<Template>,
    add: Vec<Template>,
}

/// Compiled retag rules plus exclusive groups.
#[derive(Debug, Clone)]
pub struct TagExpander {
    rules: Vec<CompiledRule>,
    groups: Vec<(String, TagSet)>,
    depth: u32,
}

impl TagExpander {
    /// Compiles a rule set, validating it first.
    pub fn new(rules: &RuleSet, depth: u32) -> Result<Self, ConfigError> {
        rules.validate()?;
        let compiled = rules
            .tags
            .iter()
            .map(|(name, rule)| compile_rule(name, rule))
            .collect::<Result<Vec<_>, _>>()?;
        let groups = rules
            .exclusive
            .iter()
            .map(|(name, group)| {
                let tags = TagSet::from_names(group.tags.iter().cloned()).map_err(|source| {
                    ConfigError::InvalidTag {
                        field: "exclusive group",
                        source,
                    }
                })?;
                Ok((name.clone(), tags))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            rules: compiled,
            groups,
            depth,
        })
    }

    /// Expander with no rules and no groups.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            groups: Vec::new(),
            depth: 1,
        }
    }

    /// Exclusive-group violations in the given set.
    pub fn violations(&self, tags: &TagSet) -> Vec<ExclusiveViolation> {
        self.groups
            .iter()
            .filter_map(|(name, group)| {
                let conflicting = group.intersection(tags);
                (conflicting.len() > 1).then(|| ExclusiveViolation {
                    group: name.clone(),
                    group_tags: group.clone(),
                    conflicting,
                })
            })
            .collect()
    }

    pub fn has_violations(&self, tags: &TagSet) -> bool {
        !self.violations(tags).is_empty()
    }

    /// The exclusive groups a set of tags belongs to, by name.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &TagSet)> {
        self.groups.iter().map(|(name, tags)| (name.as_str(), tags))
    }

    /// Expands a set to its fixed point under the rules.
    ///
    /// Violations in the input are not rejected here; checking the exported
    /// set is the engine's responsibility at export time.
    pub fn expand(&self, tags: &TagSet) -> Expansion {
        let mut seen = HashSet::new();
        let mut current = tags.clone();
        seen.insert(set_hash(&current));
        for _ in 0..self.depth {
            let next = self.apply_once(&current);
            if next == current {
                return Expansion {
                    tags: current,
                    converged: true,
                };
            }
            if !seen.insert(set_hash(&next)) {
                tracing::warn!(tags = %current, "retag expansion revisited a set; stopping");
                return Expansion {
                    tags: current,
                    converged: false,
                };
            }
            current = next;
        }
        tracing::warn!(
            depth = self.depth,
            tags = %current,
            "retag expansion did not settle within bound"
        );
        Expansion {
            tags: current,
            converged: false,
        }
    }

    /// One ordered pass over all rules.
    fn apply_once(&self, tags: &TagSet) -> TagSet {
        let mut new_tags = tags.clone();
        for rule in &self.rules {
            let matched = new_tags.intersection(&rule.source_tags);
            if matched.is_empty() {
                continue;
            }
            for tag in instantiate(&rule.remove, &matched) {
                new_tags.remove(&tag);
            }
            if !rule.replace.is_empty() {
                for tag in &matched {
                    new_tags.remove(tag);
                }
                new_tags.extend(instantiate(&rule.replace, &matched));
            }
            if !rule.add.is_empty() {
                let additions: TagSet = instantiate(&rule.add, &matched).into_iter().collect();
                let candidate = new_tags.union(&additions);
                if self.has_violations(&candidate) {
                    tracing::warn!(
                        rule = %rule.name,
                        "skipping rule additions; they would violate an exclusive group"
                    );
                } else {
                    new_tags = candidate;
                }
            }
        }
        new_tags
    }
}

fn compile_rule(name: &str, rule: &RetagRule) -> Result<CompiledRule, ConfigError> {
    let compile_list = |templates: &[String]| {
        templates
            .iter()
            .map(|raw| {
                if raw.contains(SOURCE_TAG_VAR) {
                    Ok(Template::PerSource(raw.clone()))
                } else {
                    Tag::new(raw.clone())
                        .map(Template::Literal)
                        .map_err(|_| ConfigError::RuleEmptyTemplate {
                            name: name.to_string(),
                        })
                }
            })
            .collect::<Result<Vec<_>, _>>()
    };
    Ok(CompiledRule {
        name: name.to_string(),
        source_tags: TagSet::from_names(rule.source_tags.iter().cloned()).map_err(|_| {
            ConfigError::RuleEmptyTemplate {
                name: name.to_string(),
            }
        })?,
        remove: compile_list(&rule.remove)?,
        replace: compile_list(&rule.replace)?,
        add: compile_list(&rule.add)?,
    })
}

fn instantiate(templates: &[Template], matched: &TagSet) -> Vec<Tag> {
    let mut out = Vec::new();
    for template in templates {
        match template {
            Template::Literal(tag) => out.push(tag.clone()),
            Template::PerSource(raw) => {
                for source in matched {
                    let name = raw.replace(SOURCE_TAG_VAR, source.as_str());
                    if let Ok(tag) = Tag::new(name) {
                        out.push(tag);
                    }
                }
            }
        }
    }
    out
}

fn set_hash(tags: &TagSet) -> u64 {
    let mut hasher = DefaultHasher::new();
    tags.hash(&mut hasher);
    hasher.finish()
}
