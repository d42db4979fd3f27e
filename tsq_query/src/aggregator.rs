//! Chaining of aggregation stages over groups.
//!
//! The stages themselves are supplied by the caller; this module only decides which stages
//! apply to a group and in what order they wrap it.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::trace;
use tsq_types::{Sample, SampleError, SampleIterator, TagSet};

use crate::group::{BoxedGroup, DataPointGroup, GroupByResult};

/// One stage of the aggregation pipeline.
pub trait Aggregator: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Whether this stage accepts groups of `group_type`.
    fn can_aggregate(&self, group_type: &str) -> bool;

    /// The group type of this stage's output for an input of `group_type`.
    fn aggregated_group_type(&self, group_type: &str) -> String;

    fn aggregate(&self, group: BoxedGroup) -> BoxedGroup;
}

/// Passes through at most `limit` samples of any group.
#[derive(Debug, Clone, Copy)]
pub struct LimitAggregator {
    limit: usize,
}

impl LimitAggregator {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Aggregator for LimitAggregator {
    fn name(&self) -> &str {
        "limit"
    }

    fn can_aggregate(&self, _group_type: &str) -> bool {
        true
    }

    fn aggregated_group_type(&self, group_type: &str) -> String {
        group_type.to_string()
    }

    fn aggregate(&self, group: BoxedGroup) -> BoxedGroup {
        Box::new(LimitGroup {
            inner: group,
            remaining: self.limit,
        })
    }
}

#[derive(Debug)]
struct LimitGroup {
    inner: BoxedGroup,
    remaining: usize,
}

impl Iterator for LimitGroup {
    type Item = Result<Sample, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let next = self.inner.next()?;
        self.remaining -= 1;
        Some(next)
    }
}

impl SampleIterator for LimitGroup {
    fn close(&mut self) {
        self.inner.close();
    }
}

impl DataPointGroup for LimitGroup {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn tags(&self) -> &TagSet {
        self.inner.tags()
    }

    fn group_by_results(&self) -> &[GroupByResult] {
        self.inner.group_by_results()
    }
}

/// The ordered stages applied to every group of a query: the row limit first, then the
/// configured aggregators.
#[derive(Debug, Clone, Default)]
pub struct AggregatorChain {
    stages: Vec<Arc<dyn Aggregator>>,
}

impl AggregatorChain {
    /// A `limit` of zero means no limit.
    pub fn new(limit: usize, aggregators: impl IntoIterator<Item = Arc<dyn Aggregator>>) -> Self {
        let mut stages: Vec<Arc<dyn Aggregator>> = Vec::new();
        if limit > 0 {
            stages.push(Arc::new(LimitAggregator::new(limit)));
        }
        stages.extend(aggregators);
        Self { stages }
    }

    pub fn stages(&self) -> &[Arc<dyn Aggregator>] {
        &self.stages
    }

    /// Wrap `group` with every stage that accepts its current type. Returns the wrapped group
    /// and its final group type.
    pub fn apply(&self, group: BoxedGroup, group_type: &str) -> (BoxedGroup, String) {
        let mut group = group;
        let mut group_type = group_type.to_string();
        for stage in &self.stages {
            if stage.can_aggregate(&group_type) {
                group = stage.aggregate(group);
                group_type = stage.aggregated_group_type(&group_type);
            } else {
                trace!(
                    aggregator = stage.name(),
                    %group_type,
                    "skipping aggregator for incompatible group type"
                );
            }
        }
        (group, group_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{MemoryRow, SortingGroup};
    use pretty_assertions::assert_eq;
    use tsq_types::{DataType, GROUP_NUMBER, GROUP_TEXT, Order, SampleValue, TagMap};

    /// Turns any group into a numeric group of sample counts per timestamp.
    #[derive(Debug)]
    struct CountAggregator;

    #[derive(Debug)]
    struct CountGroup(BoxedGroup);

    impl Iterator for CountGroup {
        type Item = Result<Sample, SampleError>;

        fn next(&mut self) -> Option<Self::Item> {
            self.0
                .next()
                .map(|s| s.map(|s| Sample::new(s.timestamp, 1i64)))
        }
    }

    impl SampleIterator for CountGroup {
        fn close(&mut self) {
            self.0.close()
        }
    }

    impl DataPointGroup for CountGroup {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn tags(&self) -> &TagSet {
            self.0.tags()
        }

        fn group_by_results(&self) -> &[GroupByResult] {
            self.0.group_by_results()
        }
    }

    impl Aggregator for CountAggregator {
        fn name(&self) -> &str {
            "count"
        }

        fn can_aggregate(&self, _group_type: &str) -> bool {
            true
        }

        fn aggregated_group_type(&self, _group_type: &str) -> String {
            GROUP_NUMBER.to_string()
        }

        fn aggregate(&self, group: BoxedGroup) -> BoxedGroup {
            Box::new(CountGroup(group))
        }
    }

    /// Only accepts numeric groups; doubles every value.
    #[derive(Debug)]
    struct ScaleAggregator;

    #[derive(Debug)]
    struct ScaleGroup(BoxedGroup);

    impl Iterator for ScaleGroup {
        type Item = Result<Sample, SampleError>;

        fn next(&mut self) -> Option<Self::Item> {
            self.0.next().map(|s| {
                s.map(|s| Sample::new(s.timestamp, s.value.as_f64().unwrap_or_default() * 2.0))
            })
        }
    }

    impl SampleIterator for ScaleGroup {
        fn close(&mut self) {
            self.0.close()
        }
    }

    impl DataPointGroup for ScaleGroup {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn tags(&self) -> &TagSet {
            self.0.tags()
        }

        fn group_by_results(&self) -> &[GroupByResult] {
            self.0.group_by_results()
        }
    }

    impl Aggregator for ScaleAggregator {
        fn name(&self) -> &str {
            "scale"
        }

        fn can_aggregate(&self, group_type: &str) -> bool {
            group_type == GROUP_NUMBER
        }

        fn aggregated_group_type(&self, group_type: &str) -> String {
            group_type.to_string()
        }

        fn aggregate(&self, group: BoxedGroup) -> BoxedGroup {
            Box::new(ScaleGroup(group))
        }
    }

    fn text_group() -> BoxedGroup {
        let mut group = SortingGroup::new("m", Order::Ascending);
        group.add_row(Box::new(MemoryRow::new(
            "m",
            DataType::Text,
            TagMap::new(),
            vec![Sample::new(1, "a"), Sample::new(2, "b"), Sample::new(3, "c")],
        )));
        Box::new(group)
    }

    fn values(mut group: BoxedGroup) -> Vec<SampleValue> {
        group.by_ref().map(|s| s.unwrap().value).collect()
    }

    #[test]
    fn incompatible_stage_is_skipped() {
        let chain = AggregatorChain::new(0, [Arc::new(ScaleAggregator) as Arc<dyn Aggregator>]);
        let (group, group_type) = chain.apply(text_group(), GROUP_TEXT);
        assert_eq!(group_type, GROUP_TEXT);
        assert_eq!(
            values(group),
            vec![
                SampleValue::from("a"),
                SampleValue::from("b"),
                SampleValue::from("c")
            ]
        );
    }

    #[test]
    fn stages_see_previous_output_type() {
        let chain = AggregatorChain::new(
            2,
            [
                Arc::new(CountAggregator) as Arc<dyn Aggregator>,
                Arc::new(ScaleAggregator),
            ],
        );
        assert_eq!(chain.stages().len(), 3);
        assert_eq!(chain.stages()[0].name(), "limit");

        let (group, group_type) = chain.apply(text_group(), GROUP_TEXT);
        assert_eq!(group_type, GROUP_NUMBER);
        assert_eq!(
            values(group),
            vec![SampleValue::Double(2.0), SampleValue::Double(2.0)]
        );
    }

    #[test]
    fn limit_delegates_metadata() {
        let mut group = SortingGroup::new("m", Order::Ascending);
        group.add_group_by_result(GroupByResult::Type {
            data_type: "text".to_string(),
        });
        let limited = LimitAggregator::new(1).aggregate(Box::new(group));
        assert_eq!(limited.name(), "m");
        assert_eq!(limited.group_by_results().len(), 1);
    }
}
