//! Resource tags and the reverse index from tags to cache keys.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::Fingerprint;

/// Id used by list queries, e.g. `Patient:LIST`.
pub const LIST_ID: &str = "LIST";

/// A resource class (`Patient`) or a resource instance (`Patient:42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    kind: Arc<str>,
    id: Option<Arc<str>>,
}

impl Tag {
    pub fn kind(kind: &str) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    pub fn id(kind: &str, id: impl fmt::Display) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.to_string().into()),
        }
    }

    pub fn list(kind: &str) -> Self {
        Self::id(kind, LIST_ID)
    }

    /// Parse `Kind` or `Kind:id`. The id is everything after the first colon.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((kind, id)) => Self::id(kind, id),
            None => Self::kind(s),
        }
    }

    pub fn kind_name(&self) -> &str {
        &self.kind
    }

    pub fn id_str(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether invalidating `self` invalidates a provider of `provided`,
    /// using the same matching as [`TagIndex::require`].
    pub fn covers(&self, provided: &Tag) -> bool {
        self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => f.write_str(&self.kind),
        }
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::parse(s)
    }
}

/// Which fingerprints currently provide data under which tags.
///
/// Kept in lockstep with the cache entries by the store: every mutation of
/// an entry's tags goes through `provide` or `remove` in the same critical
/// section as the entry change.
#[derive(Debug, Default)]
pub struct TagIndex {
    /// kind -> id (None for bare kind tags) -> providers
    by_kind: HashMap<Arc<str>, HashMap<Option<Arc<str>>, HashSet<Fingerprint>>>,
    by_fingerprint: HashMap<Fingerprint, HashSet<Tag>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags provided by `fingerprint`.
    pub fn provide(&mut self, fingerprint: &Fingerprint, tags: impl IntoIterator<Item = Tag>) {
        self.remove(fingerprint);
        let tags: HashSet<Tag> = tags.into_iter().collect();
        if tags.is_empty() {
            return;
        }
        for tag in &tags {
            self.by_kind
                .entry(tag.kind.clone())
                .or_default()
                .entry(tag.id.clone())
                .or_default()
                .insert(fingerprint.clone());
        }
        self.by_fingerprint.insert(fingerprint.clone(), tags);
    }

    /// Fingerprints invalidated by `tags`.
    ///
    /// A bare kind matches every provider of that kind, whatever the id. A
    /// tag with an id matches providers of exactly that tag.
    pub fn require<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> HashSet<Fingerprint> {
        let mut matched = HashSet::new();
        for tag in tags {
            let Some(ids) = self.by_kind.get(&tag.kind) else {
                continue;
            };
            match &tag.id {
                None => {
                    for providers in ids.values() {
                        matched.extend(providers.iter().cloned());
                    }
                }
                Some(_) => {
                    if let Some(providers) = ids.get(&tag.id) {
                        matched.extend(providers.iter().cloned());
                    }
                }
            }
        }
        matched
    }

    pub fn tags_of(&self, fingerprint: &Fingerprint) -> Option<&HashSet<Tag>> {
        self.by_fingerprint.get(fingerprint)
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) {
        let Some(tags) = self.by_fingerprint.remove(fingerprint) else {
            return;
        };
        for tag in tags {
            if let Some(ids) = self.by_kind.get_mut(&tag.kind) {
                if let Some(providers) = ids.get_mut(&tag.id) {
                    providers.remove(fingerprint);
                    if providers.is_empty() {
                        ids.remove(&tag.id);
                    }
                }
                if ids.is_empty() {
                    self.by_kind.remove(&tag.kind);
                }
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.by_kind.clear();
        self.by_fingerprint.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.by_fingerprint.contains_key(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(op: &str, id: i64) -> Fingerprint {
        Fingerprint::new(op, &json!(id))
    }

    #[test]
    fn test_tag_parse_and_display() {
        assert_eq!(Tag::parse("Patient:42"), Tag::id("Patient", 42));
        assert_eq!(Tag::parse("Patient"), Tag::kind("Patient"));
        assert_eq!(Tag::parse("Patient:LIST"), Tag::list("Patient"));
        assert_eq!(Tag::id("Invoice", "a:b").to_string(), "Invoice:a:b");
        assert_eq!(Tag::parse("Invoice:a:b").id_str(), Some("a:b"));
    }

    #[test]
    fn test_require_specific_id_only_hits_that_id() {
        let mut index = TagIndex::new();
        index.provide(&fp("getPatient", 42), [Tag::id("Patient", 42)]);
        index.provide(&fp("getPatient", 7), [Tag::id("Patient", 7)]);
        index.provide(&fp("getInvoice", 42), [Tag::id("Invoice", 42)]);

        let hit = index.require(&[Tag::id("Patient", 42)]);
        assert_eq!(hit, HashSet::from([fp("getPatient", 42)]));
    }

    #[test]
    fn test_covers_matches_like_require() {
        assert!(Tag::kind("Patient").covers(&Tag::id("Patient", 42)));
        assert!(Tag::kind("Patient").covers(&Tag::kind("Patient")));
        assert!(Tag::id("Patient", 42).covers(&Tag::id("Patient", 42)));
        assert!(!Tag::id("Patient", 42).covers(&Tag::id("Patient", 7)));
        assert!(!Tag::id("Patient", 42).covers(&Tag::kind("Patient")));
        assert!(!Tag::kind("Invoice").covers(&Tag::id("Patient", 42)));
    }

    #[test]
    fn test_require_bare_kind_hits_every_id() {
        let mut index = TagIndex::new();
        index.provide(&fp("getPatient", 42), [Tag::id("Patient", 42)]);
        index.provide(&fp("listPatients", 1), [Tag::list("Patient"), Tag::id("Patient", 42)]);
        index.provide(&fp("getInvoice", 1), [Tag::id("Invoice", 1)]);

        let hit = index.require(&[Tag::kind("Patient")]);
        assert_eq!(
            hit,
            HashSet::from([fp("getPatient", 42), fp("listPatients", 1)])
        );
    }

    #[test]
    fn test_provide_replaces_previous_tags() {
        let mut index = TagIndex::new();
        let key = fp("listPatients", 1);
        index.provide(&key, [Tag::id("Patient", 1), Tag::id("Patient", 2)]);
        index.provide(&key, [Tag::id("Patient", 3)]);

        assert!(index.require(&[Tag::id("Patient", 1)]).is_empty());
        assert_eq!(index.require(&[Tag::id("Patient", 3)]), HashSet::from([key]));
    }

    #[test]
    fn test_remove_leaves_no_trace() {
        let mut index = TagIndex::new();
        let key = fp("getPatient", 42);
        index.provide(&key, [Tag::id("Patient", 42), Tag::kind("Ward")]);
        index.remove(&key);

        assert!(index.is_empty());
        assert!(index.by_kind.is_empty());
        assert!(index.require(&[Tag::kind("Patient"), Tag::kind("Ward")]).is_empty());
    }

    #[test]
    fn test_clear_all() {
        let mut index = TagIndex::new();
        index.provide(&fp("getPatient", 1), [Tag::id("Patient", 1)]);
        index.clear_all();
        assert!(index.is_empty());
        assert!(!index.contains(&fp("getPatient", 1)));
    }
}
