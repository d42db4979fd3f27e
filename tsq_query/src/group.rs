//! Rows and groups: the streams handed from the cache to the aggregators.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tsq_cache::CachedRow;
use tsq_types::{
    DataType, GROUP_NUMBER, Order, Sample, SampleError, SampleIterator, TagMap, TagSet,
};

use crate::memory::MemoryMonitor;
use crate::merge::SortedMerge;

/// One time-ordered sample sequence for a single tag combination and declared type.
pub trait DataPointRow: SampleIterator {
    fn name(&self) -> &str;

    fn data_type(&self) -> DataType;

    fn tags(&self) -> &TagMap;

    fn sample_count(&self) -> usize;
}

pub type BoxedRow = Box<dyn DataPointRow>;

impl DataPointRow for CachedRow {
    fn name(&self) -> &str {
        self.metric_name()
    }

    fn data_type(&self) -> DataType {
        CachedRow::data_type(self)
    }

    fn tags(&self) -> &TagMap {
        CachedRow::tags(self)
    }

    fn sample_count(&self) -> usize {
        CachedRow::sample_count(self)
    }
}

/// A row held in memory.
#[derive(Debug)]
pub struct MemoryRow {
    name: Arc<str>,
    data_type: DataType,
    tags: TagMap,
    sample_count: usize,
    samples: std::vec::IntoIter<Sample>,
}

impl MemoryRow {
    pub fn new(name: &str, data_type: DataType, tags: TagMap, samples: Vec<Sample>) -> Self {
        Self {
            name: Arc::from(name),
            data_type,
            tags,
            sample_count: samples.len(),
            samples: samples.into_iter(),
        }
    }
}

impl Iterator for MemoryRow {
    type Item = Result<Sample, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.samples.next().map(Ok)
    }
}

impl SampleIterator for MemoryRow {
    fn close(&mut self) {
        self.samples = Vec::new().into_iter();
    }
}

impl DataPointRow for MemoryRow {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn tags(&self) -> &TagMap {
        &self.tags
    }

    fn sample_count(&self) -> usize {
        self.sample_count
    }
}

/// Records what a group represents: the declared type it was partitioned by, or the tag
/// values it was grouped on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupByResult {
    Type {
        data_type: String,
    },
    Tag {
        tag_names: Vec<String>,
        /// Values in configured tag order. Tags the group's rows lack are left out.
        tag_values: IndexMap<String, String>,
    },
}

/// The unit handed to aggregators: an ordered sample stream plus what it represents.
pub trait DataPointGroup: SampleIterator {
    fn name(&self) -> &str;

    /// Union of the tags of every row in the group.
    fn tags(&self) -> &TagSet;

    fn group_by_results(&self) -> &[GroupByResult];
}

pub type BoxedGroup = Box<dyn DataPointGroup>;

/// A group that merges its rows into one time-ordered stream.
#[derive(Debug)]
pub struct SortingGroup {
    name: Arc<str>,
    data_type: Option<DataType>,
    tags: TagSet,
    group_by_results: Vec<GroupByResult>,
    merge: SortedMerge<BoxedRow>,
    cancel: Option<CancellationToken>,
    memory: Option<MemoryMonitor>,
    stopped: bool,
}

impl SortingGroup {
    pub fn new(name: &str, order: Order) -> Self {
        Self {
            name: Arc::from(name),
            data_type: None,
            tags: TagSet::new(),
            group_by_results: Vec::new(),
            merge: SortedMerge::new(order),
            cancel: None,
            memory: None,
            stopped: false,
        }
    }

    pub fn add_row(&mut self, row: BoxedRow) {
        self.data_type.get_or_insert(row.data_type());
        self.tags.extend_from_map(row.tags());
        self.merge.add_iterator(row);
    }

    pub fn add_group_by_result(&mut self, result: GroupByResult) {
        self.group_by_results.push(result);
    }

    /// Stop the stream with [`SampleError::Cancelled`] once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Count every sample the group yields against `monitor`. Past its limits the stream ends
    /// with [`SampleError::ResourceExhausted`].
    pub fn with_memory_monitor(mut self, monitor: MemoryMonitor) -> Self {
        self.memory = Some(monitor);
        self
    }

    fn stop(&mut self, error: SampleError) -> Option<Result<Sample, SampleError>> {
        self.stopped = true;
        self.merge.close();
        Some(Err(error))
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.data_type
    }

    /// Group type the aggregator chain starts from. A group without rows counts as numeric.
    pub fn group_type(&self) -> &'static str {
        self.data_type.map_or(GROUP_NUMBER, |t| t.group_type())
    }

    pub fn order(&self) -> Order {
        self.merge.order()
    }

    pub fn row_count(&self) -> usize {
        self.merge.source_count()
    }

    pub fn sample_count(&self) -> usize {
        self.merge.sources().map(|row| row.sample_count()).sum()
    }
}

impl Iterator for SortingGroup {
    type Item = Result<Sample, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return self.stop(SampleError::Cancelled);
        }

        let next = self.merge.next();
        if matches!(next, Some(Ok(_))) {
            let exhausted = self.memory.as_mut().and_then(|m| m.check(1).err());
            if let Some(e) = exhausted {
                return self.stop(SampleError::ResourceExhausted(e.to_string()));
            }
        }
        next
    }
}

impl SampleIterator for SortingGroup {
    fn close(&mut self) {
        self.merge.close();
    }
}

impl DataPointGroup for SortingGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &TagSet {
        &self.tags
    }

    fn group_by_results(&self) -> &[GroupByResult] {
        &self.group_by_results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLimits, MemoryProbe};
    use pretty_assertions::assert_eq;
    use std::num::NonZeroUsize;
    use tsq_types::{GROUP_TEXT, tag_map};

    fn text_row(host: &str, samples: &[(i64, &str)]) -> BoxedRow {
        Box::new(MemoryRow::new(
            "m",
            DataType::Text,
            tag_map([("host", host)]),
            samples.iter().map(|(t, v)| Sample::new(*t, *v)).collect(),
        ))
    }

    #[test]
    fn group_unions_row_tags() {
        let mut group = SortingGroup::new("m", Order::Ascending);
        assert_eq!(group.group_type(), GROUP_NUMBER);
        group.add_row(text_row("a", &[(1, "x"), (3, "z")]));
        group.add_row(text_row("b", &[(2, "y")]));

        assert_eq!(group.group_type(), GROUP_TEXT);
        assert_eq!(group.row_count(), 2);
        assert_eq!(group.sample_count(), 3);
        assert_eq!(group.tags().get("host").unwrap().len(), 2);

        let timestamps: Vec<i64> = group.by_ref().map(|s| s.unwrap().timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[test]
    fn cancellation_ends_the_stream() {
        let token = CancellationToken::new();
        let mut group =
            SortingGroup::new("m", Order::Ascending).with_cancellation(token.clone());
        group.add_row(text_row("a", &[(1, "x"), (2, "y")]));

        assert!(group.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(group.next(), Some(Err(SampleError::Cancelled))));
        assert!(group.next().is_none());
    }

    #[derive(Debug)]
    struct FullMemory;

    impl MemoryProbe for FullMemory {
        fn used_percent(&self) -> f64 {
            99.0
        }
    }

    #[test]
    fn draining_under_memory_pressure_stops_the_stream() {
        let limits = MemoryLimits {
            check_interval: NonZeroUsize::new(2).unwrap(),
            max_used_percent: 90,
            max_samples: None,
            probe: Arc::new(FullMemory),
        };
        let mut group =
            SortingGroup::new("m", Order::Ascending).with_memory_monitor(limits.monitor());
        group.add_row(text_row("a", &[(1, "x"), (3, "z")]));
        group.add_row(text_row("b", &[(2, "y")]));

        assert!(group.next().unwrap().is_ok());
        assert!(matches!(
            group.next(),
            Some(Err(SampleError::ResourceExhausted(_)))
        ));
        assert!(group.next().is_none());
    }
}
