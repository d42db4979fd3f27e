//! Query execution for time series.
//!
//! A [`QueryEngine`] turns a [`QueryMetric`] into ordered, aggregated groups:
//!
//! 1. the query waits in the [`QueryQueue`] until a slot is free and no identical query runs,
//! 2. the raw rows are read from a fresh or reused [`tsq_cache::CachedSearchResult`], scanning
//!    the [`Datastore`] on a cache miss,
//! 3. rows are partitioned by [`group_by_type_and_tag`] into groups that merge their rows with
//!    a [`SortedMerge`],
//! 4. each group is wrapped by the [`AggregatorChain`].
//!
//! Closing the [`DatastoreQuery`] closes the groups and releases the query's slot.

mod admission;
mod aggregator;
mod datastore;
mod engine;
mod group;
mod grouping;
mod memory;
mod merge;

pub use admission::{AdmissionError, QueryQueue, RunningQuery};
pub use aggregator::{Aggregator, AggregatorChain, LimitAggregator};
pub use datastore::{Datastore, DatastoreError, MemoryDatastore, SampleSink, SinkError};
pub use engine::{
    CreateQueryEngineArgs, DatastoreQuery, QueryEngine, QueryError, QueryMetric, QueryState,
    Result,
};
pub use group::{
    BoxedGroup, BoxedRow, DataPointGroup, DataPointRow, GroupByResult, MemoryRow, SortingGroup,
};
pub use grouping::{TagGroupBy, group_by_type_and_tag, tag_group_key};
pub use memory::{MemoryError, MemoryLimits, MemoryMonitor, MemoryProbe, SystemMemoryProbe};
pub use merge::SortedMerge;
