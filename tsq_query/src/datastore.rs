//! The storage scan the engine reads raw rows from.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tsq_cache::{CachedSearchResult, RowWriter};
use tsq_types::{DataType, Sample, SampleValue, TagMap};

use crate::engine::QueryMetric;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cache error: {0}")]
    Cache(#[from] tsq_cache::Error),

    #[error("query was cancelled")]
    Cancelled,

    #[error("sample added before any row was started")]
    NoActiveRow,
}

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("scan failed: {0}")]
    Scan(Box<dyn std::error::Error + Send + Sync>),
}

/// Receives the rows of a scan. Starting a row ends the previous one.
pub trait SampleSink {
    fn start_row(&mut self, data_type: DataType, tags: TagMap) -> Result<(), SinkError>;

    fn add_sample(&mut self, timestamp: i64, value: SampleValue) -> Result<(), SinkError>;

    fn end_row(&mut self) -> Result<(), SinkError>;
}

/// A storage engine that can scan the rows matching a query.
pub trait Datastore: Send + Sync + Debug {
    /// Feed every row matching `query` into `sink`, samples in ascending time order.
    fn query_database(
        &self,
        query: &QueryMetric,
        sink: &mut dyn SampleSink,
    ) -> Result<(), DatastoreError>;
}

/// Writes scanned rows into a query cache.
#[derive(Debug)]
pub(crate) struct CacheSink<'a> {
    cache: &'a CachedSearchResult,
    cancel: &'a CancellationToken,
    current: Option<RowWriter>,
    rows: usize,
}

impl<'a> CacheSink<'a> {
    pub(crate) fn new(cache: &'a CachedSearchResult, cancel: &'a CancellationToken) -> Self {
        Self {
            cache,
            cancel,
            current: None,
            rows: 0,
        }
    }

    /// End the last row. Returns the number of rows written.
    pub(crate) fn finish(mut self) -> Result<usize, SinkError> {
        self.end_row()?;
        Ok(self.rows)
    }
}

impl SampleSink for CacheSink<'_> {
    fn start_row(&mut self, data_type: DataType, tags: TagMap) -> Result<(), SinkError> {
        self.end_row()?;
        if self.cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        self.current = Some(self.cache.start_row(data_type, tags));
        Ok(())
    }

    fn add_sample(&mut self, timestamp: i64, value: SampleValue) -> Result<(), SinkError> {
        let row = self.current.as_mut().ok_or(SinkError::NoActiveRow)?;
        row.add_sample(timestamp, value)?;
        Ok(())
    }

    fn end_row(&mut self) -> Result<(), SinkError> {
        if let Some(row) = self.current.take() {
            if row.sample_count() > 0 {
                self.rows += 1;
            }
            row.close()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Series {
    metric: String,
    data_type: DataType,
    tags: TagMap,
    samples: Vec<Sample>,
}

/// A datastore holding every series in memory.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    series: RwLock<Vec<Series>>,
    scans: AtomicUsize,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series. Samples are sorted by timestamp.
    pub fn add_series(
        &self,
        metric: &str,
        data_type: DataType,
        tags: TagMap,
        samples: impl IntoIterator<Item = Sample>,
    ) {
        let mut samples: Vec<Sample> = samples.into_iter().collect();
        samples.sort_by_key(|s| s.timestamp);
        self.series.write().push(Series {
            metric: metric.to_string(),
            data_type,
            tags,
            samples,
        });
    }

    /// Number of scans served so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }
}

impl Datastore for MemoryDatastore {
    fn query_database(
        &self,
        query: &QueryMetric,
        sink: &mut dyn SampleSink,
    ) -> Result<(), DatastoreError> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let series = self.series.read();

        let mut rows = 0;
        for s in series.iter().filter(|s| s.metric == query.name) {
            let matches_tags = query.tags.iter().all(|(key, values)| {
                s.tags
                    .get(key.as_str())
                    .is_some_and(|value| values.contains(value.as_ref()))
            });
            if !matches_tags {
                continue;
            }

            sink.start_row(s.data_type, s.tags.clone())?;
            for sample in s
                .samples
                .iter()
                .filter(|x| x.timestamp >= query.start_time && x.timestamp <= query.end_time)
            {
                sink.add_sample(sample.timestamp, sample.value.clone())?;
            }
            rows += 1;
        }
        sink.end_row()?;

        debug!(metric = %query.name, rows, "scanned memory datastore");
        Ok(())
    }
}
