//! The query lifecycle: admission, cache population or reuse, grouping and aggregation.

use std::fmt::Display;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tsq_cache::{CacheDirectory, CachedSearchResult, RotationHandle};
use tsq_clap_blocks::query::QueryEngineConfig;
use tsq_types::{Order, QueryFingerprint, SampleError, SampleIterator, TagFilter};

use crate::admission::{AdmissionError, QueryQueue};
use crate::aggregator::{Aggregator, AggregatorChain};
use crate::datastore::{CacheSink, Datastore, DatastoreError, SinkError};
use crate::group::{BoxedGroup, BoxedRow};
use crate::grouping::{TagGroupBy, group_by_type_and_tag};
use crate::memory::{MemoryError, MemoryLimits, SystemMemoryProbe};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query was cancelled")]
    Cancelled,

    #[error("query cache error: {0}")]
    Cache(#[from] tsq_cache::Error),

    #[error("query cache directory error: {0}")]
    CacheDirectory(#[from] std::io::Error),

    #[error("datastore error: {0}")]
    Datastore(#[source] DatastoreError),

    #[error("error reading samples: {0}")]
    Sample(#[source] SampleError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] MemoryError),

    #[error("query is {actual}, expected it to be {expected}")]
    InvalidState {
        expected: QueryState,
        actual: QueryState,
    },
}

impl From<AdmissionError> for QueryError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<DatastoreError> for QueryError {
    fn from(e: DatastoreError) -> Self {
        match e {
            DatastoreError::Sink(SinkError::Cancelled) => Self::Cancelled,
            DatastoreError::Sink(SinkError::Cache(e)) => Self::Cache(e),
            e => Self::Datastore(e),
        }
    }
}

impl From<SinkError> for QueryError {
    fn from(e: SinkError) -> Self {
        DatastoreError::Sink(e).into()
    }
}

impl From<SampleError> for QueryError {
    fn from(e: SampleError) -> Self {
        match e {
            SampleError::Cancelled => Self::Cancelled,
            e => Self::Sample(e),
        }
    }
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;

/// Describes one query.
#[derive(Debug, Clone)]
pub struct QueryMetric {
    pub name: String,
    /// Inclusive range in milliseconds since the epoch.
    pub start_time: i64,
    pub end_time: i64,
    pub tags: TagFilter,
    /// How old a cached result may be and still be reused. Zero never reuses a cache.
    pub cache_time: Duration,
    pub order: Order,
    /// Maximum samples per group. Zero means no limit.
    pub limit: usize,
    pub group_by: Option<TagGroupBy>,
    pub aggregators: Vec<Arc<dyn Aggregator>>,
}

impl QueryMetric {
    pub fn new(name: impl Into<String>, start_time: i64, end_time: i64) -> Self {
        Self {
            name: name.into(),
            start_time,
            end_time,
            tags: TagFilter::new(),
            cache_time: Duration::ZERO,
            order: Order::default(),
            limit: 0,
            group_by: None,
            aggregators: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.entry(key.into()).or_default().insert(value.into());
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_tag_group_by(mut self, group_by: TagGroupBy) -> Self {
        self.group_by = Some(group_by);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregators.push(aggregator);
        self
    }

    pub fn fingerprint(&self) -> QueryFingerprint {
        QueryFingerprint::new(&self.name, self.start_time, self.end_time, &self.tags)
    }
}

/// Everything needed to build a [`QueryEngine`].
#[derive(Debug)]
pub struct CreateQueryEngineArgs {
    pub datastore: Arc<dyn Datastore>,
    pub cache_dir: Arc<CacheDirectory>,
    pub max_concurrent_queries: NonZeroUsize,
    pub collision_backoff: Duration,
    pub keep_cache_files: bool,
    /// Rotate the cache directory on this interval while the engine is alive.
    pub cache_rotation_interval: Option<Duration>,
    pub memory: MemoryLimits,
}

impl CreateQueryEngineArgs {
    pub fn from_config(
        config: &QueryEngineConfig,
        datastore: Arc<dyn Datastore>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            datastore,
            cache_dir: Arc::new(CacheDirectory::new(config.cache_dir())?),
            max_concurrent_queries: config.max_concurrent_queries,
            collision_backoff: config.query_collision_backoff,
            keep_cache_files: config.keep_cache_files,
            cache_rotation_interval: Some(config.cache_rotation_interval),
            memory: MemoryLimits {
                check_interval: config.memory_check_interval,
                max_used_percent: config.max_memory_used_percent,
                max_samples: config.max_samples_per_query,
                probe: Arc::new(SystemMemoryProbe::new()),
            },
        })
    }
}

#[derive(Debug)]
struct EngineInner {
    datastore: Arc<dyn Datastore>,
    cache_dir: Arc<CacheDirectory>,
    queue: QueryQueue<Arc<QueryMetric>>,
    keep_cache_files: bool,
    memory: MemoryLimits,
    _rotation: Option<RotationHandle>,
}

/// Creates and tracks queries. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueryEngine(Arc<EngineInner>);

impl QueryEngine {
    pub fn new(args: CreateQueryEngineArgs) -> Self {
        let CreateQueryEngineArgs {
            datastore,
            cache_dir,
            max_concurrent_queries,
            collision_backoff,
            keep_cache_files,
            cache_rotation_interval,
            memory,
        } = args;

        let rotation = cache_rotation_interval.and_then(|interval| {
            cache_dir
                .spawn_rotation(interval)
                .inspect_err(|error| warn!(%error, "failed to start query cache rotation"))
                .ok()
        });
        info!(
            max_concurrent_queries = max_concurrent_queries.get(),
            keep_cache_files,
            cache_root = ?cache_dir.root(),
            "query engine created"
        );

        Self(Arc::new(EngineInner {
            datastore,
            cache_dir,
            queue: QueryQueue::new(max_concurrent_queries.get(), collision_backoff),
            keep_cache_files,
            memory,
            _rotation: rotation,
        }))
    }

    pub fn create_query(&self, metric: QueryMetric) -> DatastoreQuery {
        let fingerprint = metric.fingerprint();
        DatastoreQuery {
            engine: Arc::clone(&self.0),
            metric: Arc::new(metric),
            fingerprint,
            cancel: CancellationToken::new(),
            state: QueryState::Created,
            admitted: false,
            groups: Vec::new(),
            sample_count: 0,
            row_count: 0,
        }
    }

    /// Cancel the running query with `fingerprint`. Returns false when no such query runs.
    pub fn cancel_query(&self, fingerprint: &QueryFingerprint) -> bool {
        self.0.queue.cancel(fingerprint)
    }

    pub fn running_queries(&self) -> Vec<(QueryFingerprint, Arc<QueryMetric>)> {
        self.0
            .queue
            .running_queries()
            .into_iter()
            .map(|(fingerprint, query)| (fingerprint, query.descriptor))
            .collect()
    }

    pub fn waiting_count(&self) -> usize {
        self.0.queue.waiting_count()
    }

    pub fn available_permits(&self) -> usize {
        self.0.queue.available_permits()
    }

    pub fn collision_count(&self) -> u64 {
        self.0.queue.collision_count()
    }

    pub fn cache_dir(&self) -> &Arc<CacheDirectory> {
        &self.0.cache_dir
    }

    /// Swap the cache directory now, waiting for the old one to be deleted.
    pub fn rotate_cache_dir(&self) {
        self.0.cache_dir.rotate(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Admitted,
    Executing,
    Completed,
    Closed,
    Failed,
}

impl Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Admitted => "admitted",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One execution of a [`QueryMetric`].
///
/// The admission slot taken by [`execute`](Self::execute) is held until the query is closed or
/// dropped, so the returned groups can be consumed without racing an identical query.
#[derive(Debug)]
pub struct DatastoreQuery {
    engine: Arc<EngineInner>,
    metric: Arc<QueryMetric>,
    fingerprint: QueryFingerprint,
    cancel: CancellationToken,
    state: QueryState,
    admitted: bool,
    groups: Vec<BoxedGroup>,
    sample_count: usize,
    row_count: usize,
}

impl DatastoreQuery {
    pub fn metric(&self) -> &QueryMetric {
        &self.metric
    }

    pub fn fingerprint(&self) -> &QueryFingerprint {
        &self.fingerprint
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Samples across every row read, counted before aggregation.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Cancels this query, whether it is waiting for admission or running.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the query and return its groups.
    ///
    /// Blocks until the query is admitted. On error the query ends up
    /// [`Failed`](QueryState::Failed) and its admission slot is already released.
    pub fn execute(&mut self) -> Result<&mut [BoxedGroup]> {
        if self.state != QueryState::Created {
            return Err(QueryError::InvalidState {
                expected: QueryState::Created,
                actual: self.state,
            });
        }

        if let Err(e) =
            self.engine
                .queue
                .acquire(&self.fingerprint, Arc::clone(&self.metric), &self.cancel)
        {
            self.state = QueryState::Failed;
            return Err(e.into());
        }
        self.admitted = true;
        self.state = QueryState::Admitted;

        self.state = QueryState::Executing;
        match self.run() {
            Ok(groups) => {
                self.groups = groups;
                self.state = QueryState::Completed;
                debug!(
                    fingerprint = %self.fingerprint,
                    rows = self.row_count,
                    samples = self.sample_count,
                    groups = self.groups.len(),
                    "query executed"
                );
                Ok(&mut self.groups)
            }
            Err(e) => {
                warn!(fingerprint = %self.fingerprint, error = %e, "query failed");
                self.state = QueryState::Failed;
                self.release();
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<Vec<BoxedGroup>> {
        let engine = &self.engine;
        let metric = &self.metric;
        let base = engine.cache_dir.file_base(&self.fingerprint)?;

        let cached = if metric.cache_time.is_zero() {
            None
        } else {
            CachedSearchResult::open(&metric.name, &base, metric.cache_time, engine.keep_cache_files)
        };
        let cache = match cached {
            Some(cache) => {
                debug!(fingerprint = %self.fingerprint, "using cached query result");
                cache
            }
            None => {
                let cache =
                    CachedSearchResult::create(&metric.name, &base, engine.keep_cache_files)?;
                let mut sink = CacheSink::new(&cache, &self.cancel);
                let scanned = engine
                    .datastore
                    .query_database(metric, &mut sink)
                    .map_err(QueryError::from)
                    .and_then(|()| sink.finish().map_err(QueryError::from));
                if let Err(e) = scanned {
                    cache.discard();
                    return Err(e);
                }
                cache
            }
        };

        let rows = cache.get_rows()?;
        cache.close();

        let mut monitor = engine.memory.monitor();
        let mut boxed: Vec<BoxedRow> = Vec::with_capacity(rows.len());
        for row in rows {
            if self.cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            monitor.check(row.sample_count())?;
            boxed.push(Box::new(row));
        }
        self.row_count = boxed.len();
        self.sample_count = monitor.count();

        let groups = group_by_type_and_tag(
            &metric.name,
            boxed,
            metric.group_by.as_ref(),
            metric.order,
        );
        let chain = AggregatorChain::new(metric.limit, metric.aggregators.iter().cloned());
        Ok(groups
            .into_iter()
            .map(|group| {
                let group_type = group.group_type();
                let group = group
                    .with_cancellation(self.cancel.clone())
                    .with_memory_monitor(engine.memory.monitor());
                chain.apply(Box::new(group), group_type).0
            })
            .collect())
    }

    /// Close every group and give the admission slot back.
    pub fn close(mut self) {
        self.close_groups();
        self.state = QueryState::Closed;
        self.release();
    }

    fn close_groups(&mut self) {
        for group in &mut self.groups {
            group.close();
        }
        self.groups.clear();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.admitted) {
            self.engine.queue.release(&self.fingerprint);
        }
    }
}

impl Drop for DatastoreQuery {
    fn drop(&mut self) {
        self.close_groups();
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{MemoryDatastore, SampleSink};
    use crate::memory::MemoryProbe;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tsq_types::{DataType, Sample, tag_map};

    #[derive(Debug)]
    struct FailingDatastore;

    impl Datastore for FailingDatastore {
        fn query_database(
            &self,
            _query: &QueryMetric,
            sink: &mut dyn SampleSink,
        ) -> Result<(), DatastoreError> {
            sink.start_row(DataType::Long, tag_map([("host", "a")]))?;
            sink.add_sample(1, 1i64.into())?;
            sink.start_row(DataType::Long, tag_map([("host", "b")]))?;
            Err(DatastoreError::Scan("storage node unavailable".into()))
        }
    }

    #[derive(Debug)]
    struct FullMemory;

    impl MemoryProbe for FullMemory {
        fn used_percent(&self) -> f64 {
            99.0
        }
    }

    fn engine(dir: &TempDir, datastore: Arc<dyn Datastore>, keep: bool) -> QueryEngine {
        QueryEngine::new(CreateQueryEngineArgs {
            datastore,
            cache_dir: Arc::new(CacheDirectory::new(dir.path()).unwrap()),
            max_concurrent_queries: NonZeroUsize::new(2).unwrap(),
            collision_backoff: Duration::from_millis(5),
            keep_cache_files: keep,
            cache_rotation_interval: None,
            memory: MemoryLimits::default(),
        })
    }

    fn cache_files(engine: &QueryEngine) -> usize {
        std::fs::read_dir(engine.cache_dir().cache_dir().unwrap())
            .unwrap()
            .count()
    }

    #[test_log::test]
    fn failed_scan_releases_and_discards() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(FailingDatastore), true);

        let mut query = engine.create_query(QueryMetric::new("cpu", 0, 10));
        let err = query.execute().unwrap_err();
        assert!(matches!(err, QueryError::Datastore(DatastoreError::Scan(_))));
        assert_eq!(query.state(), QueryState::Failed);
        assert_eq!(engine.available_permits(), 2);
        assert_eq!(cache_files(&engine), 0);

        assert!(matches!(
            query.execute(),
            Err(QueryError::InvalidState {
                expected: QueryState::Created,
                actual: QueryState::Failed
            })
        ));
    }

    #[test]
    fn memory_exhaustion_fails_the_query() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDatastore::new());
        store.add_series(
            "cpu",
            DataType::Long,
            tag_map([("host", "a")]),
            (0..10).map(|t| Sample::new(t, t)),
        );
        let engine = QueryEngine::new(CreateQueryEngineArgs {
            datastore: store,
            cache_dir: Arc::new(CacheDirectory::new(dir.path()).unwrap()),
            max_concurrent_queries: NonZeroUsize::new(1).unwrap(),
            collision_backoff: Duration::from_millis(5),
            keep_cache_files: false,
            cache_rotation_interval: None,
            memory: MemoryLimits {
                check_interval: NonZeroUsize::new(5).unwrap(),
                max_used_percent: 90,
                max_samples: None,
                probe: Arc::new(FullMemory),
            },
        });

        let mut query = engine.create_query(QueryMetric::new("cpu", 0, 100));
        assert!(matches!(
            query.execute(),
            Err(QueryError::ResourceExhausted(MemoryError::MemoryUsage { .. }))
        ));
        assert_eq!(engine.available_permits(), 1);
        assert_eq!(cache_files(&engine), 0);
    }

    #[derive(Debug, Default)]
    struct SwitchedMemory(AtomicBool);

    impl MemoryProbe for SwitchedMemory {
        fn used_percent(&self) -> f64 {
            if self.0.load(Ordering::SeqCst) { 99.0 } else { 10.0 }
        }
    }

    #[test]
    fn memory_is_checked_while_groups_drain() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDatastore::new());
        store.add_series(
            "cpu",
            DataType::Long,
            tag_map([("host", "a")]),
            (0..4).map(|t| Sample::new(t, t)),
        );
        let probe = Arc::new(SwitchedMemory::default());
        let engine = QueryEngine::new(CreateQueryEngineArgs {
            datastore: store,
            cache_dir: Arc::new(CacheDirectory::new(dir.path()).unwrap()),
            max_concurrent_queries: NonZeroUsize::new(1).unwrap(),
            collision_backoff: Duration::from_millis(5),
            keep_cache_files: false,
            cache_rotation_interval: None,
            memory: MemoryLimits {
                check_interval: NonZeroUsize::new(2).unwrap(),
                max_used_percent: 90,
                max_samples: None,
                probe: Arc::clone(&probe) as Arc<dyn MemoryProbe>,
            },
        });

        let mut query = engine.create_query(QueryMetric::new("cpu", 0, 100));
        let groups = query.execute().unwrap();
        probe.0.store(true, Ordering::SeqCst);

        let results: Vec<_> = groups[0].by_ref().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = match &results[1] {
            Err(SampleError::ResourceExhausted(message)) => message.clone(),
            other => panic!("unexpected result {other:?}"),
        };
        assert!(err.contains("exceeds the limit of 90%"), "{err}");

        query.close();
        assert_eq!(engine.available_permits(), 1);
    }

    #[test]
    fn dropping_an_executed_query_releases() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(MemoryDatastore::new()), false);
        let mut query = engine.create_query(QueryMetric::new("cpu", 0, 10));
        assert_eq!(query.execute().unwrap().len(), 1);
        assert_eq!(query.state(), QueryState::Completed);
        assert_eq!(engine.available_permits(), 1);
        assert_eq!(engine.running_queries().len(), 1);
        drop(query);
        assert_eq!(engine.available_permits(), 2);
    }

    #[test]
    fn state_names() {
        assert_eq!(QueryState::Executing.to_string(), "executing");
        let err = QueryError::InvalidState {
            expected: QueryState::Created,
            actual: QueryState::Closed,
        };
        assert_eq!(err.to_string(), "query is closed, expected it to be created");
    }
}
