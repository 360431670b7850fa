//! Core type definitions with validation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
}

/// Generates a validated string newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new value after validation.
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(value))
            }

            /// Returns the value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id! {
    /// An opaque tag string attached to intervals and accumulated time.
    Tag, "tag"
}

define_string_id! {
    /// Unique identifier for an event.
    EventId, "event id"
}

define_string_id! {
    /// Identifier of the watcher/source that produced an event.
    SourceId, "source id"
}

/// A set of opaque tags: unique, unordered, no duplicates by construction.
///
/// Iteration order is deterministic (lexicographic), which keeps export
/// operations, expansion cycle detection, and reconciliation reports stable
/// across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    /// Creates an empty tag set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Builds a tag set from raw strings, validating each.
    pub fn from_names<I, S>(names: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().map(Tag::new).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    /// Inserts a tag, returning whether it was newly added.
    pub fn insert(&mut self, tag: Tag) -> bool {
        self.0.insert(tag)
    }

    /// Removes a tag, returning whether it was present.
    pub fn remove(&mut self, tag: &Tag) -> bool {
        self.0.remove(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Tags present in `self` but not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// Tags present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// Tags present in either set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Copy of this set without the given tag.
    #[must_use]
    pub fn without(&self, tag: &Tag) -> Self {
        let mut out = self.clone();
        out.remove(tag);
        out
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Tag> for TagSet {
    fn extend<I: IntoIterator<Item = Tag>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for TagSet {
    type Item = Tag;
    type IntoIter = std::collections::btree_set::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::collections::btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{tag}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Tag Tests ==========

    #[test]
    fn tag_accepts_opaque_strings() {
        let tag = Tag::new("deep-work").unwrap();
        assert_eq!(tag.as_str(), "deep-work");
        assert_eq!(tag.to_string(), "deep-work");
    }

    #[test]
    fn tag_rejects_empty() {
        let result = Tag::new("");
        assert_eq!(result, Err(ValidationError::Empty { field: "tag" }));
    }

    #[test]
    fn tag_serde_round_trip() {
        let tag = Tag::new("coding").unwrap();
        let json = serde_json::to_string(&tag).unwrap();
        assert_eq!(json, "\"coding\"");
        let back: Tag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn tag_deserialize_rejects_empty() {
        let result: Result<Tag, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    // ========== EventId / SourceId Tests ==========

    #[test]
    fn event_id_validates() {
        assert!(EventId::new("e-1").is_ok());
        assert_eq!(
            EventId::new(""),
            Err(ValidationError::Empty { field: "event id" })
        );
    }

    #[test]
    fn source_id_display_matches_input() {
        let source = SourceId::new("user-idle").unwrap();
        assert_eq!(source.to_string(), "user-idle");
    }

    // ========== TagSet Tests ==========

    fn tags(names: &[&str]) -> TagSet {
        TagSet::from_names(names.iter().copied()).unwrap()
    }

    #[test]
    fn tag_set_deduplicates() {
        let set = tags(&["work", "work", "email"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&Tag::new("work").unwrap()));
    }

    #[test]
    fn tag_set_display_is_sorted() {
        let set = tags(&["writing", "coding", "email"]);
        assert_eq!(set.to_string(), "coding email writing");
    }

    #[test]
    fn tag_set_subset_and_difference() {
        let small = tags(&["work"]);
        let big = tags(&["work", "email"]);
        assert!(small.is_subset(&big));
        assert!(!big.is_subset(&small));
        assert_eq!(big.difference(&small), tags(&["email"]));
        assert_eq!(big.intersection(&small), tags(&["work"]));
    }

    #[test]
    fn tag_set_serde_round_trip() {
        let set = tags(&["a", "b"]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[\"a\",\"b\"]");
        let back: TagSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn tag_set_without_leaves_original_untouched() {
        let set = tags(&["a", "b"]);
        let trimmed = set.without(&Tag::new("a").unwrap());
        assert_eq!(trimmed, tags(&["b"]));
        assert_eq!(set.len(), 2);
    }
}
