//! Per-section engine settings
//!
//! Each section maps to one table of the TOML configuration file and is
//! consumed by exactly one part of the engine:
//!
//! - [`WorkerSettings`] - worker thread count and idle backoff
//! - [`PoolSettings`] - event pool sharding and the in-flight limit
//! - [`SourceSettings`] - batch bounds and the fetch failure policy
//! - [`TopologySettings`] - queue capacity, push policy, default parallelism

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of worker threads
pub const DEFAULT_NTHREADS: usize = 4;

/// Default per-location event pool size
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Default capacity of a queue between two arrows
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default maximum number of items fetched per source turn
pub const DEFAULT_MAX_BATCH: usize = 10;

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of worker threads started by `Engine::run`
    pub nthreads: usize,

    /// First sleep after the scheduler had nothing to hand out (microseconds)
    pub idle_backoff_min_us: u64,

    /// Upper bound of the doubling idle backoff (microseconds)
    pub idle_backoff_max_us: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            nthreads: DEFAULT_NTHREADS,
            idle_backoff_min_us: 50,
            idle_backoff_max_us: 5_000,
        }
    }
}

impl WorkerSettings {
    pub fn idle_backoff_min(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_min_us)
    }

    pub fn idle_backoff_max(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_max_us)
    }
}

/// Event pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of pooled events per location
    pub pool_size: usize,

    /// Number of independent local pools
    pub location_count: usize,

    /// When set, checkout from an empty pool fails instead of allocating
    pub limit_total_events_in_flight: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            location_count: 1,
            limit_total_events_in_flight: true,
        }
    }
}

/// What a source arrow does when `EventSource::fetch` returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorPolicy {
    /// Stop fetching for this turn and retry on a later turn
    #[default]
    StopTurn,
    /// Propagate the failure as a fatal stage failure
    Fatal,
}

/// Source arrow settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// A fetch turn only starts when at least this many items can be accepted
    pub min_batch: usize,

    /// Maximum number of items fetched in a single turn
    pub max_batch: usize,

    /// Handling of unexpected fetch failures
    pub fetch_error_policy: FetchErrorPolicy,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            min_batch: 1,
            max_batch: DEFAULT_MAX_BATCH,
            fetch_error_policy: FetchErrorPolicy::StopTurn,
        }
    }
}

/// Behaviour of `Queue::push` when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushPolicy {
    /// Hand the item back immediately
    #[default]
    FailFast,
    /// Wait up to the configured timeout, then hand the item back
    Blocking,
}

/// Topology construction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySettings {
    /// Capacity of queues created without an explicit capacity
    pub queue_capacity: usize,

    /// Push policy applied to every queue
    pub push_policy: PushPolicy,

    /// Wait bound for [`PushPolicy::Blocking`] (milliseconds)
    pub push_timeout_ms: u64,

    /// Parallelism limit of arrows added without an explicit limit
    pub default_parallelism: usize,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            push_policy: PushPolicy::FailFast,
            push_timeout_ms: 10,
            default_parallelism: 1,
        }
    }
}

impl TopologySettings {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}
