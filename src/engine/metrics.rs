//! Throughput and lifecycle metrics.
//!
//! - [`ArrowMetrics`] - per-arrow execution counts and busy time
//! - [`TopologyMetrics`] - run start/stop timestamps, thread count and the
//!   topology status transition log
//! - [`MetricsReport`] - serializable snapshot assembled by the engine

use crate::engine::worker::WorkerStats;
use crate::types::{ArrowStatus, StreamStatus, TopologyStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Per-arrow execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ArrowCounters {
    executions: u64,
    successes: u64,
    come_back_later: u64,
    finished: u64,
    errors: u64,
    busy: Duration,
    last_status: Option<StreamStatus>,
}

/// Execution metrics of a single arrow, updated by workers.
#[derive(Debug, Default)]
pub struct ArrowMetrics {
    counters: Mutex<ArrowCounters>,
}

impl ArrowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed `execute()` call
    pub fn record(&self, status: StreamStatus, elapsed: Duration) {
        let mut c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        c.executions += 1;
        c.busy += elapsed;
        c.last_status = Some(status);
        match status {
            StreamStatus::Success => c.successes += 1,
            StreamStatus::ComeBackLater => c.come_back_later += 1,
            StreamStatus::Finished => c.finished += 1,
            StreamStatus::Error => c.errors += 1,
        }
    }

    pub fn reset(&self) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = ArrowCounters::default();
    }

    /// Snapshot against a wall-clock window of `uptime`
    pub fn snapshot(
        &self,
        name: &str,
        status: ArrowStatus,
        active: usize,
        parallelism: usize,
        uptime: Duration,
    ) -> ArrowMetricsSnapshot {
        let c = self.counters.lock().unwrap_or_else(PoisonError::into_inner).clone();
        // Busy time can exceed uptime when executions overlap.
        let capacity = uptime * parallelism.max(1) as u32;
        ArrowMetricsSnapshot {
            name: name.to_string(),
            status,
            active_executions: active,
            parallelism,
            executions: c.executions,
            successes: c.successes,
            come_back_later: c.come_back_later,
            finished: c.finished,
            errors: c.errors,
            active_time: c.busy,
            idle_time: capacity.saturating_sub(c.busy),
            last_status: c.last_status,
        }
    }
}

/// Serializable view of one arrow's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ArrowMetricsSnapshot {
    pub name: String,
    pub status: ArrowStatus,
    pub active_executions: usize,
    pub parallelism: usize,
    pub executions: u64,
    pub successes: u64,
    pub come_back_later: u64,
    pub finished: u64,
    pub errors: u64,
    pub active_time: Duration,
    pub idle_time: Duration,
    pub last_status: Option<StreamStatus>,
}

/// One entry in the topology status transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub at: DateTime<Utc>,
    pub from: TopologyStatus,
    pub to: TopologyStatus,
}

#[derive(Debug, Default)]
struct RunWindow {
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    stopped: Option<Instant>,
    thread_count: usize,
}

/// Aggregate metrics for the topology.
#[derive(Debug, Default)]
pub struct TopologyMetrics {
    window: Mutex<RunWindow>,
    transitions: Mutex<Vec<StatusTransition>>,
    /// Status drain() left plus one; zero when nothing is pending.
    pending_drain: AtomicU8,
    pending_drain_at: AtomicI64,
}

impl TopologyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the run window (the transition log is kept).
    pub fn reset(&self) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = RunWindow::default();
    }

    pub fn start(&self, thread_count: usize) {
        let mut w = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        w.started_at = Some(Utc::now());
        w.started = Some(Instant::now());
        w.stopped_at = None;
        w.stopped = None;
        w.thread_count = thread_count;
    }

    pub fn stop(&self) {
        let mut w = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if w.started.is_some() && w.stopped.is_none() {
            w.stopped_at = Some(Utc::now());
            w.stopped = Some(Instant::now());
        }
    }

    /// Length of the current (or last) run window
    pub fn uptime(&self) -> Duration {
        let w = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        match (w.started, w.stopped) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).thread_count
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).stopped_at
    }

    pub fn record_transition(&self, from: TopologyStatus, to: TopologyStatus) {
        let mut log = self.log();
        log.push(StatusTransition {
            at: Utc::now(),
            from,
            to,
        });
    }

    /// Note a move to Draining using atomics only; the entry joins the
    /// log on the next `record_transition` or `transitions` call.
    pub(crate) fn note_drain(&self, from: TopologyStatus) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as i64);
        self.pending_drain_at.store(nanos, Ordering::Relaxed);
        self.pending_drain.store(from.as_u8() + 1, Ordering::Release);
    }

    pub fn transitions(&self) -> Vec<StatusTransition> {
        self.log().clone()
    }

    fn log(&self) -> MutexGuard<'_, Vec<StatusTransition>> {
        let mut log = self.transitions.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = self.pending_drain.swap(0, Ordering::AcqRel);
        if pending != 0 {
            let nanos = self.pending_drain_at.load(Ordering::Relaxed);
            log.push(StatusTransition {
                at: DateTime::<Utc>::from_timestamp_nanos(nanos),
                from: TopologyStatus::from_u8(pending - 1),
                to: TopologyStatus::Draining,
            });
        }
        log
    }
}

/// Snapshot of the whole engine, suitable for logging or JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub status: TopologyStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub uptime: Duration,
    pub thread_count: usize,
    pub events_read: u64,
    pub tasks_created: u64,
    pub events_in_flight: usize,
    pub arrows: Vec<ArrowMetricsSnapshot>,
    pub workers: Vec<WorkerStats>,
    pub transitions: Vec<StatusTransition>,
}

impl MetricsReport {
    /// Events read from all sources per second of uptime
    pub fn throughput_hz(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.events_read as f64 / secs
        }
    }

    /// Metrics of the arrow named `name`
    pub fn arrow(&self, name: &str) -> Option<&ArrowMetricsSnapshot> {
        self.arrows.iter().find(|a| a.name == name)
    }
}
