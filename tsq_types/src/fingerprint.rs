use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Tag filter of a query: the accepted values for each tag key.
pub type TagFilter = BTreeMap<String, BTreeSet<String>>;

/// Deterministic identity of a query, used as the cache file key and as the key for
/// de-duplicating identical queries in flight.
///
/// The canonical text is `{start}:{end}:{metric}:` followed by `{key}={value}:` for every
/// filtered tag value, keys and values in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryFingerprint {
    text: Arc<str>,
    file_stem: Arc<str>,
}

impl QueryFingerprint {
    pub fn new(metric_name: &str, start_time: i64, end_time: i64, tags: &TagFilter) -> Self {
        let mut text = format!("{start_time}:{end_time}:{metric_name}:");
        for (key, values) in tags {
            for value in values {
                text.push_str(key);
                text.push('=');
                text.push_str(value);
                text.push(':');
            }
        }

        let file_stem = hex::encode(Sha256::digest(text.as_bytes()));
        Self {
            text: text.into(),
            file_stem: file_stem.into(),
        }
    }

    /// The canonical text this fingerprint was derived from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Lowercase hex SHA-256 of the canonical text; safe to use as a file name.
    pub fn file_stem(&self) -> &str {
        &self.file_stem
    }
}

impl Display for QueryFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_stem)
    }
}
