//! Stage arrows: user processing applied to events taken from a queue.
//!
//! A [`StageArrow`] pops one event from its input queue, runs its chain of
//! [`Stage`] plugins over it and pushes it to its output queue. Without an
//! output queue the arrow is a sink and recycles the event into the pool.

use crate::engine::arrow::{Arrow, ArrowCore, ExecutionContext};
use crate::engine::port::PortDescriptor;
use crate::engine::queue::Queue;
use crate::error::{EngineError, EngineResult};
use crate::pool::{Event, EventHandle, EventPool};
use crate::types::{ExecutionPhase, StreamStatus};
use anyhow::Context;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// User processing plugin.
///
/// The engine guarantees `configure` runs once before the first `execute`,
/// and `change_run` runs before the first `execute` of every new run number.
///
/// `execute` takes `&self` and may be called from several workers at once,
/// up to the arrow's parallelism. `configure`, `change_run` and `finish` get
/// exclusive access: they wait for in-flight executions of this stage.
pub trait Stage: Send + Sync {
    /// Human-readable name of this stage.
    fn name(&self) -> &str;

    /// Products this stage reads.
    fn inputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }

    /// Products this stage writes.
    fn outputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }

    fn configure(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn change_run(&mut self, _run_number: i32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one event.
    fn execute(&self, run_number: i32, event_number: u64, event: &mut Event) -> anyhow::Result<()>;

    /// Called once at topology finish, only if `configure` ran.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct StageSlot {
    stage: Box<dyn Stage>,
    configured: bool,
    last_run: Option<i32>,
}

impl StageSlot {
    fn ready_for(&self, run_number: i32) -> bool {
        self.configured && self.last_run == Some(run_number)
    }
}

/// Decrements a counter on drop, so panicking executions are accounted for.
struct InProgress<'a>(&'a AtomicUsize);

impl<'a> InProgress<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Arrow running a chain of stages over events from one input queue.
pub struct StageArrow {
    core: ArrowCore,
    input: Arc<Queue<EventHandle>>,
    output: Option<Arc<Queue<EventHandle>>>,
    /// Read-locked for `execute`, write-locked for the other hooks
    stages: Vec<RwLock<StageSlot>>,
    backlog: Mutex<VecDeque<EventHandle>>,
    in_progress: AtomicUsize,
}

impl StageArrow {
    pub fn new(
        name: impl Into<String>,
        input: Arc<Queue<EventHandle>>,
        output: Option<Arc<Queue<EventHandle>>>,
        stages: Vec<Box<dyn Stage>>,
        parallelism: usize,
    ) -> Self {
        Self {
            core: ArrowCore::new(name, parallelism),
            input,
            output,
            stages: stages
                .into_iter()
                .map(|stage| {
                    RwLock::new(StageSlot {
                        stage,
                        configured: false,
                        last_run: None,
                    })
                })
                .collect(),
            backlog: Mutex::new(VecDeque::new()),
            in_progress: AtomicUsize::new(0),
        }
    }

    pub fn is_sink(&self) -> bool {
        self.output.is_none()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn flush_backlog(&self, backlog: &mut VecDeque<EventHandle>) {
        let Some(output) = &self.output else {
            return;
        };
        while let Some(handle) = backlog.pop_front() {
            if let Err(handle) = output.push(handle) {
                backlog.push_front(handle);
                break;
            }
        }
    }

    /// Run every stage over `event`, in order.
    fn process(&self, event: &mut Event) -> EngineResult<()> {
        let run_number = event.run_number();
        let event_number = event.event_number();
        for slot in &self.stages {
            {
                let slot = slot.read().unwrap_or_else(PoisonError::into_inner);
                if slot.ready_for(run_number) {
                    self.execute_stage(slot.stage.as_ref(), run_number, event_number, event)?;
                    continue;
                }
            }

            // First event of this stage, or of a new run: prepare exclusively.
            let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
            let StageSlot {
                stage,
                configured,
                last_run,
            } = &mut *slot;

            if !*configured {
                stage
                    .configure()
                    .with_context(|| format!("stage '{}'", stage.name()))
                    .map_err(|e| EngineError::stage(self.name(), ExecutionPhase::Configure, e))?;
                *configured = true;
            }
            if *last_run != Some(run_number) {
                stage
                    .change_run(run_number)
                    .with_context(|| format!("stage '{}', run {}", stage.name(), run_number))
                    .map_err(|e| EngineError::stage(self.name(), ExecutionPhase::ChangeRun, e))?;
                *last_run = Some(run_number);
            }
            self.execute_stage(stage.as_ref(), run_number, event_number, event)?;
        }
        Ok(())
    }

    fn execute_stage(
        &self,
        stage: &dyn Stage,
        run_number: i32,
        event_number: u64,
        event: &mut Event,
    ) -> EngineResult<()> {
        stage
            .execute(run_number, event_number, event)
            .with_context(|| format!("stage '{}', event {}", stage.name(), event_number))
            .map_err(|e| EngineError::stage(self.name(), ExecutionPhase::Execute, e))?;
        event.record_stage_execution();
        Ok(())
    }

    /// Input drained and nothing of ours is still in flight.
    fn stream_done(&self) -> bool {
        self.input.is_drained()
            && self.in_progress.load(Ordering::SeqCst) == 0
            && self
                .backlog
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }
}

impl Arrow for StageArrow {
    fn core(&self) -> &ArrowCore {
        &self.core
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> EngineResult<StreamStatus> {
        {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            self.flush_backlog(&mut backlog);
            if !backlog.is_empty() {
                return Ok(StreamStatus::ComeBackLater);
            }
        }
        if self.output.as_ref().is_some_and(|out| out.is_full()) {
            return Ok(StreamStatus::ComeBackLater);
        }

        let guard = InProgress::enter(&self.in_progress);
        let Some(handle) = self.input.pop() else {
            drop(guard);
            return Ok(if self.stream_done() {
                StreamStatus::Finished
            } else {
                StreamStatus::ComeBackLater
            });
        };

        if let Err(e) = ctx.pool.with_event_mut(&handle, |event| self.process(event)) {
            ctx.pool.put(handle, ctx.location);
            return Err(e);
        }

        match &self.output {
            Some(output) => {
                let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(handle) = output.push(handle) {
                    backlog.push_back(handle);
                }
            }
            None => ctx.pool.put(handle, ctx.location),
        }
        drop(guard);
        Ok(StreamStatus::Success)
    }

    fn finalize(&self, pool: &EventPool) -> EngineResult<()> {
        {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            self.flush_backlog(&mut backlog);
            if !backlog.is_empty() {
                tracing::warn!(
                    "Arrow '{}' finished with {} unflushed events; returning them to the pool",
                    self.name(),
                    backlog.len()
                );
                for handle in backlog.drain(..) {
                    pool.put(handle, 0);
                }
            }
        }

        let mut first_error = None;
        for slot in &self.stages {
            let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
            if !slot.configured {
                continue;
            }
            slot.configured = false;
            let name = slot.stage.name().to_string();
            if let Err(e) = slot.stage.finish() {
                tracing::error!("Stage '{}' in arrow '{}' failed to finish: {:#}", name, self.name(), e);
                first_error.get_or_insert(EngineError::stage(
                    self.name(),
                    ExecutionPhase::Finalize,
                    e.context(format!("stage '{}'", name)),
                ));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Inputs not already produced by an earlier stage in the chain
    fn inputs(&self) -> Vec<PortDescriptor> {
        let mut produced: Vec<PortDescriptor> = Vec::new();
        let mut required = Vec::new();
        for slot in &self.stages {
            let slot = slot.read().unwrap_or_else(PoisonError::into_inner);
            for input in slot.stage.inputs() {
                if !produced.iter().any(|out| input.accepts(out)) {
                    required.push(input);
                }
            }
            produced.extend(slot.stage.outputs());
        }
        required
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        self.stages
            .iter()
            .flat_map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).stage.outputs())
            .collect()
    }
}
