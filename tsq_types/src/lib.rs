//! Data types shared by the query cache and the query engine.
//!
//! A query reads [`Sample`]s out of storage one row at a time. Every row carries a declared
//! [`DataType`] and a [`TagMap`]; rows are merged into groups that carry the union of their
//! member tags as a [`TagSet`]. Identical queries are recognised through their
//! [`QueryFingerprint`].

mod fingerprint;
mod sample;
mod tags;

pub use fingerprint::{QueryFingerprint, TagFilter};
pub use sample::{DataType, GROUP_NUMBER, GROUP_TEXT, Sample, SampleValue, UnknownDataType};
pub use tags::{TagMap, TagSet, tag_map};

use std::cmp::Ordering;
use std::fmt::Debug;

/// Error produced while pulling samples out of a row or a group.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("io error reading samples: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt sample data: {0}")]
    Corrupt(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("query was cancelled")]
    Cancelled,
}

/// A time-ordered stream of samples that holds resources until it is closed.
///
/// `close` must be idempotent. Implementations also close on drop so an iterator that is
/// abandoned part way through never leaks the file handles behind it.
pub trait SampleIterator: Iterator<Item = Result<Sample, SampleError>> + Send + Debug {
    fn close(&mut self);
}

impl<T: SampleIterator + ?Sized> SampleIterator for Box<T> {
    fn close(&mut self) {
        (**self).close()
    }
}

/// Sort direction of query output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    /// Orient an ascending comparison in this direction.
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Ascending => ordering,
            Self::Descending => ordering.reverse(),
        }
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            other => Err(format!("invalid sort order '{other}'")),
        }
    }
}
