use std::path::PathBuf;
use std::time::Duration;

/// How the WAL makes appended records durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every append. Highest durability, highest latency.
    Immediate,
    /// fsync on a fixed interval; writers are acked once the batch
    /// containing their record has been synced.
    Interval(Duration),
    /// No fsync at all, OS page cache only. Test configurations only.
    None,
}

/// Immutable process-wide configuration, threaded into every component
/// constructor at startup. Never re-read mid-process.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_path: PathBuf,

    /// Shard count used by create_index when the caller does not pick one.
    pub default_shard_count: u32,

    pub wal_sync: SyncPolicy,

    /// Buffered write count that triggers a background commit.
    pub commit_batch_size: usize,
    /// Maximum age of the oldest buffered write before a commit is forced.
    pub commit_interval: Duration,

    /// Ceiling on `from + size` for any search request.
    pub max_result_window: usize,
    /// Per-shard deadline for search fan-out.
    pub search_timeout: Duration,

    /// Node identifier for ID generation, unique per node (10 bits).
    pub node_id: u16,
    /// Backward clock motion tolerated by the ID generator before failing.
    pub clock_skew_tolerance: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: PathBuf::from("./data"),
            default_shard_count: 4,
            wal_sync: SyncPolicy::Interval(Duration::from_millis(50)),
            commit_batch_size: 1000,
            commit_interval: Duration::from_secs(5),
            max_result_window: 10_000,
            search_timeout: Duration::from_secs(10),
            node_id: 0,
            clock_skew_tolerance: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Configuration for disk-backed tests: no fsync, tight intervals.
    pub fn for_tests(data_path: PathBuf) -> Self {
        Config {
            data_path,
            wal_sync: SyncPolicy::None,
            commit_interval: Duration::from_millis(100),
            ..Config::default()
        }
    }
}
