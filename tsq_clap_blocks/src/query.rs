//! Config for the query engine: admission limits, the on-disk result cache and the memory guard.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the cache root used when `--query-cache-dir` is not given.
pub const DEFAULT_CACHE_DIR_NAME: &str = "tsq-cache";

/// CLI config for the query engine.
#[derive(Debug, Clone, clap::Parser)]
pub struct QueryEngineConfig {
    /// Maximum number of queries executing at once. Further queries wait for a free slot.
    #[clap(
        long = "max-concurrent-queries",
        env = "TSQ_MAX_CONCURRENT_QUERIES",
        default_value = "10",
        action
    )]
    pub max_concurrent_queries: NonZeroUsize,

    /// Root directory for query result caches.
    ///
    /// Defaults to a `tsq-cache` directory under the system temp directory.
    #[clap(long = "query-cache-dir", env = "TSQ_QUERY_CACHE_DIR", action)]
    pub query_cache_dir: Option<PathBuf>,

    /// Keep cache files after a query finishes so later identical queries can reuse them.
    #[clap(
        long = "keep-cache-files",
        env = "TSQ_KEEP_CACHE_FILES",
        default_value_t = false,
        action
    )]
    pub keep_cache_files: bool,

    /// How often the cache directory is swapped for a fresh one and the old one deleted.
    #[clap(
        long = "cache-rotation-interval",
        env = "TSQ_CACHE_ROTATION_INTERVAL",
        default_value = "1h",
        value_parser = humantime::parse_duration
    )]
    pub cache_rotation_interval: Duration,

    /// How long a query waits before retrying when an identical query is already running.
    #[clap(
        long = "query-collision-backoff",
        env = "TSQ_QUERY_COLLISION_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub query_collision_backoff: Duration,

    /// Number of samples read between two checks of system memory usage.
    #[clap(
        long = "memory-check-interval",
        env = "TSQ_MEMORY_CHECK_INTERVAL",
        default_value = "100000",
        action
    )]
    pub memory_check_interval: NonZeroUsize,

    /// Fail a query when system memory usage goes above this percentage.
    #[clap(
        long = "max-memory-used-percent",
        env = "TSQ_MAX_MEMORY_USED_PERCENT",
        default_value = "95",
        value_parser = clap::value_parser!(u8).range(1..=100),
        action
    )]
    pub max_memory_used_percent: u8,

    /// Hard limit on the number of samples a single query may read.
    #[clap(
        long = "max-samples-per-query",
        env = "TSQ_MAX_SAMPLES_PER_QUERY",
        action
    )]
    pub max_samples_per_query: Option<NonZeroUsize>,
}

impl QueryEngineConfig {
    /// The configured cache root, or the default under the system temp directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.query_cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use std::ffi::OsString;

    #[test]
    fn defaults() {
        let config = QueryEngineConfig::parse_from(std::iter::empty::<OsString>());
        assert_eq!(config.max_concurrent_queries.get(), 10);
        assert!(!config.keep_cache_files);
        assert_eq!(config.cache_rotation_interval, Duration::from_secs(3600));
        assert_eq!(config.query_collision_backoff, Duration::from_millis(100));
        assert_eq!(config.memory_check_interval.get(), 100_000);
        assert_eq!(config.max_memory_used_percent, 95);
        assert!(config.max_samples_per_query.is_none());
        assert_eq!(
            config.cache_dir(),
            std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME)
        );
    }

    #[test]
    fn flags() {
        let config = QueryEngineConfig::parse_from([
            "test",
            "--max-concurrent-queries",
            "2",
            "--query-cache-dir",
            "/var/cache/tsq",
            "--keep-cache-files",
            "--cache-rotation-interval",
            "15m",
            "--query-collision-backoff",
            "5ms",
            "--max-samples-per-query",
            "1000",
        ]);
        assert_eq!(config.max_concurrent_queries.get(), 2);
        assert_eq!(config.cache_dir(), PathBuf::from("/var/cache/tsq"));
        assert!(config.keep_cache_files);
        assert_eq!(config.cache_rotation_interval, Duration::from_secs(900));
        assert_eq!(config.query_collision_backoff, Duration::from_millis(5));
        assert_eq!(config.max_samples_per_query.map(|n| n.get()), Some(1000));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(
            QueryEngineConfig::try_parse_from(["test", "--max-concurrent-queries", "0"]).is_err()
        );
        assert!(
            QueryEngineConfig::try_parse_from(["test", "--max-memory-used-percent", "101"])
                .is_err()
        );
        assert!(
            QueryEngineConfig::try_parse_from(["test", "--query-collision-backoff", "soon"])
                .is_err()
        );
    }
}
