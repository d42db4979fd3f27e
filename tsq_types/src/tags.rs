use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Tags of a single row: exactly one value per tag key.
pub type TagMap = BTreeMap<Arc<str>, Arc<str>>;

/// Build a [`TagMap`] from key/value pairs.
pub fn tag_map<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> TagMap
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (Arc::from(k.as_ref()), Arc::from(v.as_ref())))
        .collect()
}

/// The tags of a group: every value seen for each key across the group's rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<Arc<str>, BTreeSet<Arc<str>>>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &Arc<str>, value: &Arc<str>) {
        self.0
            .entry(Arc::clone(key))
            .or_default()
            .insert(Arc::clone(value));
    }

    pub fn extend_from_map(&mut self, tags: &TagMap) {
        for (key, value) in tags {
            self.add(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<Arc<str>>> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &BTreeSet<Arc<str>>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
