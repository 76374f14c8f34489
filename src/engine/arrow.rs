//! Arrow abstraction: one processing stage of the topology.
//!
//! Two-layer design:
//! - **[`ArrowCore`]** - the state every arrow shares with the scheduler:
//!   name, lifecycle status, parallelism limit, active-execution count,
//!   end-of-stream flags and metrics. All of it is atomic so that `pause()`
//!   never blocks.
//! - **[`Arrow`] trait** - the stage-specific part (`execute`, `finalize`,
//!   declared product ports). Built-in kinds are
//!   [`SourceArrow`](crate::engine::source::SourceArrow) and
//!   [`StageArrow`](crate::engine::stage::StageArrow); user code may implement
//!   the trait directly. The scheduler only ever sees `dyn Arrow`.

use crate::engine::id::WorkerId;
use crate::engine::metrics::ArrowMetrics;
use crate::engine::port::PortDescriptor;
use crate::engine::source::SourceArrow;
use crate::error::{EngineError, EngineResult};
use crate::pool::EventPool;
use crate::types::{ArrowStatus, StreamStatus};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Context passed to `Arrow::execute` by the worker.
pub struct ExecutionContext<'a> {
    /// Worker running this execution
    pub worker: WorkerId,
    /// Event pool location the worker is pinned to
    pub location: usize,
    /// Pool to check events out of and return them to
    pub pool: &'a EventPool,
}

/// Scheduling and lifecycle state common to all arrows.
#[derive(Debug)]
pub struct ArrowCore {
    name: String,
    status: AtomicU8,
    parallelism: AtomicUsize,
    /// Modified only under the scheduler mutex
    active: AtomicUsize,
    /// Set once the arrow reported `StreamStatus::Finished`
    stream_finished: AtomicBool,
    /// Outputs have been told this producer is done
    outputs_closed: AtomicBool,
    metrics: ArrowMetrics,
}

impl ArrowCore {
    pub fn new(name: impl Into<String>, parallelism: usize) -> Self {
        Self {
            name: name.into(),
            status: AtomicU8::new(ArrowStatus::Unopened.as_u8()),
            parallelism: AtomicUsize::new(parallelism.max(1)),
            active: AtomicUsize::new(0),
            stream_finished: AtomicBool::new(false),
            outputs_closed: AtomicBool::new(false),
            metrics: ArrowMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ArrowStatus {
        ArrowStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.status() == ArrowStatus::Running
    }

    /// Maximum number of concurrent executions
    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::Acquire)
    }

    /// Change the concurrency limit. Only the topology builder calls this.
    pub(crate) fn set_parallelism(&self, parallelism: usize) {
        self.parallelism.store(parallelism.max(1), Ordering::Release);
    }

    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &ArrowMetrics {
        &self.metrics
    }

    /// Claim an execution slot if the arrow is Running and below its limit.
    ///
    /// Callers must hold the scheduler mutex.
    pub(crate) fn try_reserve(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let active = self.active.load(Ordering::Acquire);
        if active >= self.parallelism() {
            return false;
        }
        self.active.store(active + 1, Ordering::Release);
        true
    }

    /// Give back an execution slot. Callers must hold the scheduler mutex.
    pub(crate) fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "arrow '{}' released a slot it did not hold", self.name);
    }

    fn transition(&self, from: ArrowStatus, to: ArrowStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Running -> Paused. No-op (returns false) from any other state.
    ///
    /// Executions already in progress are not interrupted.
    pub fn pause(&self) -> bool {
        self.transition(ArrowStatus::Running, ArrowStatus::Paused)
    }

    /// Unopened/Paused -> Running, unless the arrow already hit end-of-stream.
    pub fn run(&self) -> bool {
        if self.is_stream_finished() {
            return false;
        }
        self.transition(ArrowStatus::Unopened, ArrowStatus::Running)
            || self.transition(ArrowStatus::Paused, ArrowStatus::Running)
    }

    /// Move to Finished. `Ok(true)` means the caller must run teardown;
    /// `Ok(false)` means teardown already happened.
    pub(crate) fn begin_finish(&self) -> EngineResult<bool> {
        loop {
            let current = self.status();
            match current {
                ArrowStatus::Finished => return Ok(false),
                ArrowStatus::Running => {
                    return Err(EngineError::ProtocolViolation(format!(
                        "finish() called on arrow '{}' while Running",
                        self.name
                    )))
                }
                ArrowStatus::Unopened | ArrowStatus::Paused => {
                    if self.transition(current, ArrowStatus::Finished) {
                        return Ok(true);
                    }
                }
            }
        }
    }

    pub fn is_stream_finished(&self) -> bool {
        self.stream_finished.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stream_finished(&self) {
        self.stream_finished.store(true, Ordering::Release);
    }

    /// Forget an end-of-stream caused by closed inputs, so `run()` works again.
    pub(crate) fn clear_stream_finished(&self) -> bool {
        self.stream_finished.swap(false, Ordering::AcqRel)
    }

    /// Returns true exactly once per close/reopen cycle.
    pub(crate) fn close_outputs(&self) -> bool {
        !self.outputs_closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn reopen_outputs(&self) -> bool {
        self.outputs_closed.swap(false, Ordering::AcqRel)
    }

    pub fn outputs_closed(&self) -> bool {
        self.outputs_closed.load(Ordering::Acquire)
    }
}

/// A processing stage the scheduler can hand to a worker.
pub trait Arrow: Send + Sync {
    /// Shared scheduling state
    fn core(&self) -> &ArrowCore;

    /// Attempt one unit of work.
    fn execute(&self, ctx: &ExecutionContext<'_>) -> EngineResult<StreamStatus>;

    /// One-time teardown, invoked by [`Arrow::finish`].
    fn finalize(&self, _pool: &EventPool) -> EngineResult<()> {
        Ok(())
    }

    /// Products this arrow requires on incoming events
    fn inputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }

    /// Products this arrow adds to outgoing events
    fn outputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }

    /// Downcast hook for source arrows
    fn as_source(&self) -> Option<&SourceArrow> {
        None
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn status(&self) -> ArrowStatus {
        self.core().status()
    }

    fn pause(&self) -> bool {
        self.core().pause()
    }

    fn run(&self) -> bool {
        self.core().run()
    }

    /// Tear the arrow down once. Legal from Paused (or never-opened);
    /// a second call is a no-op; Running is rejected.
    fn finish(&self, pool: &EventPool) -> EngineResult<()> {
        if self.core().begin_finish()? {
            tracing::debug!("Finalizing arrow '{}'", self.name());
            self.finalize(pool)
        } else {
            Ok(())
        }
    }
}
