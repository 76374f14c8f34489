//! Scheduler: hands arrows to requesting workers.
//!
//! First-come-first-served dynamic scheduling. Every decision is made under
//! one mutex: the worker's previous result is recorded, end-of-stream is
//! propagated, then arrows are scanned from a rotating cursor and the first
//! Running arrow below its parallelism limit is reserved and returned.
//! Stage work runs outside the lock.

use crate::engine::arrow::Arrow;
use crate::engine::id::{ArrowId, WorkerId};
use crate::engine::topology::Topology;
use crate::types::{StreamStatus, TopologyStatus};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct SchedulerState {
    /// Next arrow index to consider
    cursor: usize,
    /// Current assignment of each worker that has checked in
    assignments: Vec<Option<ArrowId>>,
    decisions: u64,
}

impl SchedulerState {
    fn record(&mut self, worker: WorkerId, assignment: Option<ArrowId>) {
        let idx = worker.index();
        if idx >= self.assignments.len() {
            self.assignments.resize(idx + 1, None);
        }
        self.assignments[idx] = assignment;
    }
}

/// Central assignment policy shared by all workers.
pub struct Scheduler {
    topology: Arc<Topology>,
    worker_count: usize,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(topology: Arc<Topology>, worker_count: usize) -> Self {
        Self {
            topology,
            worker_count,
            state: Mutex::new(SchedulerState {
                assignments: vec![None; worker_count],
                ..SchedulerState::default()
            }),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Report the previous assignment's outcome and pick the next arrow.
    ///
    /// `None` means nothing is eligible right now; the worker should idle.
    pub fn next_assignment(
        &self,
        worker: WorkerId,
        previous: Option<ArrowId>,
        result: StreamStatus,
    ) -> Option<ArrowId> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = previous {
            self.report(previous, result);
        }
        self.reconcile();

        let arrows = self.topology.arrows();
        let n = arrows.len();
        state.decisions += 1;
        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if arrows[idx].core().try_reserve() {
                let id = ArrowId(idx as u32);
                state.cursor = (idx + 1) % n;
                state.record(worker, Some(id));
                return Some(id);
            }
        }
        state.record(worker, None);
        None
    }

    /// Report a final outcome; the worker will not call back again.
    pub fn last_assignment(&self, worker: WorkerId, arrow: Option<ArrowId>, result: StreamStatus) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(arrow) = arrow {
            self.report(arrow, result);
        }
        state.record(worker, None);
        self.reconcile();
        tracing::trace!("{} checked out of the scheduler", worker);
    }

    /// Current assignment of each worker, by worker index
    pub fn assignments(&self) -> Vec<Option<ArrowId>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .assignments
            .clone()
    }

    /// Number of assignment decisions made so far
    pub fn decisions(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).decisions
    }

    /// Release the slot held for `id` and act on its status.
    fn report(&self, id: ArrowId, result: StreamStatus) {
        let Some(arrow) = self.topology.arrow(id) else {
            tracing::warn!("Scheduler got a report for unknown arrow {}", id);
            return;
        };
        arrow.core().release();
        match result {
            StreamStatus::Finished => {
                if !arrow.core().is_stream_finished() {
                    tracing::debug!("Arrow '{}' reached end of stream", arrow.name());
                }
                arrow.core().mark_stream_finished();
                arrow.pause();
            }
            StreamStatus::Error => {
                arrow.pause();
            }
            StreamStatus::Success | StreamStatus::ComeBackLater => {}
        }
    }

    /// Propagate end-of-stream and detect quiescence.
    fn reconcile(&self) {
        let draining = self.topology.status() == TopologyStatus::Draining;
        for (idx, arrow) in self.topology.arrows().iter().enumerate() {
            let core = arrow.core();
            if core.outputs_closed() || core.is_running() || core.active_executions() > 0 {
                continue;
            }
            let id = ArrowId(idx as u32);
            let drained_source = draining
                && arrow
                    .as_source()
                    .is_some_and(|source| source.try_flush_backlog());
            if core.is_stream_finished() || drained_source {
                self.topology.close_outputs(id);
            }
        }
        self.topology.achieve_pause_if_quiescent();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count)
            .field("arrows", &self.topology.arrows().len())
            .finish()
    }
}
