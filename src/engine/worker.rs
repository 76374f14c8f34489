//! Worker thread loop.
//!
//! Each worker repeatedly asks the [`Scheduler`] for an arrow, executes it
//! outside any global lock, and reports the resulting status on its next
//! check-in. When nothing is eligible the worker backs off exponentially
//! (bounded by the configured idle backoff) instead of blocking.
//!
//! Stage failures and panics never unwind past the loop: they are recorded
//! against the arrow and sent to the controller as [`WorkerReport::Failure`].

use crate::config::WorkerSettings;
use crate::engine::arrow::{Arrow, ExecutionContext};
use crate::engine::id::{ArrowId, WorkerId};
use crate::engine::scheduler::Scheduler;
use crate::error::EngineError;
use crate::types::{ExecutionPhase, StreamStatus};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Messages from workers to the engine controller
#[derive(Debug)]
pub enum WorkerReport {
    /// An arrow raised a stage failure or panicked
    Failure { worker: WorkerId, error: EngineError },
}

/// Per-worker counters, returned when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker: u32,
    /// Arrow executions performed
    pub assignments: u64,
    /// Check-ins that returned no assignment
    pub idle_checkins: u64,
    pub failures: u64,
    pub busy_time: Duration,
    pub idle_time: Duration,
}

/// One thread's request/execute/report loop.
pub struct Worker {
    id: WorkerId,
    location: usize,
    scheduler: Arc<Scheduler>,
    running: Arc<AtomicBool>,
    report_tx: Sender<WorkerReport>,
    backoff_min: Duration,
    backoff_max: Duration,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        scheduler: Arc<Scheduler>,
        running: Arc<AtomicBool>,
        report_tx: Sender<WorkerReport>,
        settings: &WorkerSettings,
    ) -> Self {
        let location = id.index() % scheduler.topology().pool().location_count();
        Self {
            id,
            location,
            scheduler,
            running,
            report_tx,
            backoff_min: settings.idle_backoff_min(),
            backoff_max: settings.idle_backoff_max(),
            stats: WorkerStats {
                worker: id.0,
                ..WorkerStats::default()
            },
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Event pool location this worker checks events out of
    pub fn location(&self) -> usize {
        self.location
    }

    /// Run until the shared `running` flag is cleared.
    pub fn run(mut self) -> WorkerStats {
        tracing::debug!("{} started (pool location {})", self.id, self.location);
        let topology = Arc::clone(self.scheduler.topology());
        let mut previous: Option<ArrowId> = None;
        let mut last = StreamStatus::Success;
        let mut backoff = self.backoff_min;

        while self.running.load(Ordering::Acquire) {
            let Some(id) = self.scheduler.next_assignment(self.id, previous.take(), last) else {
                let started = Instant::now();
                thread::sleep(backoff);
                self.stats.idle_time += started.elapsed();
                self.stats.idle_checkins += 1;
                backoff = (backoff * 2).min(self.backoff_max);
                continue;
            };
            backoff = self.backoff_min;

            last = match topology.arrow(id) {
                Some(arrow) => self.execute(arrow),
                None => StreamStatus::Error,
            };
            previous = Some(id);
            if last == StreamStatus::ComeBackLater {
                thread::yield_now();
            }
        }

        self.scheduler.last_assignment(self.id, previous, last);
        tracing::debug!(
            "{} stopped after {} assignments",
            self.id,
            self.stats.assignments
        );
        self.stats
    }

    fn execute(&mut self, arrow: &dyn Arrow) -> StreamStatus {
        let pool = self.scheduler.topology().pool();
        let ctx = ExecutionContext {
            worker: self.id,
            location: self.location,
            pool,
        };

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| arrow.execute(&ctx)));
        let elapsed = started.elapsed();

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(error)) => {
                self.fail(error);
                StreamStatus::Error
            }
            Err(payload) => {
                let error = EngineError::stage(
                    arrow.name(),
                    ExecutionPhase::Execute,
                    anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
                );
                self.fail(error);
                StreamStatus::Error
            }
        };

        arrow.core().metrics().record(status, elapsed);
        self.stats.assignments += 1;
        self.stats.busy_time += elapsed;
        status
    }

    fn fail(&mut self, error: EngineError) {
        tracing::error!("{}: {}", self.id, error);
        self.stats.failures += 1;
        // The controller may already be gone during teardown.
        let _ = self.report_tx.send(WorkerReport::Failure {
            worker: self.id,
            error,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
