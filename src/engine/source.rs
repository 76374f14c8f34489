//! Source arrows: pulling events from an external producer.
//!
//! An [`EventSource`] is user code that is not assumed to be thread-safe.
//! [`SourceArrow`] guarantees that at most one worker is fetching from it at
//! any instant, using a non-blocking [`FetchGate`]: a worker that loses the
//! race does not wait, it returns an empty batch and goes back to the
//! scheduler for different work.
//!
//! Each turn fetches a batch of up to `max_batch` events (bounded by the free
//! space in the output queue) to amortize scheduling overhead. Items that
//! could not be pushed because the output filled up in the meantime are
//! parked in a backlog and flushed first on the next turn.

use crate::config::{FetchErrorPolicy, SourceSettings};
use crate::engine::arrow::{Arrow, ArrowCore, ExecutionContext};
use crate::engine::port::PortDescriptor;
use crate::engine::queue::Queue;
use crate::error::{EngineError, EngineResult};
use crate::pool::{Event, EventHandle, EventPool};
use crate::types::{ExecutionPhase, StreamStatus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Result of a single `EventSource::fetch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The event was filled in and is ready for processing
    Ready,
    /// The source is permanently exhausted
    NoMoreEvents,
    /// The source is busy; retry on a later turn
    Busy,
    /// Nothing available right now; retry on a later turn
    TryAgain,
}

/// External producer of events.
///
/// `open` is called lazily on the first fetch, never at construction.
/// An `Err` from `fetch` is an unexpected condition handled according to the
/// configured [`FetchErrorPolicy`].
pub trait EventSource: Send {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fill `event` with the next item, or report why none is available.
    fn fetch(&mut self, event: &mut Event) -> anyhow::Result<FetchStatus>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Number of events successfully produced so far
    fn events_emitted(&self) -> u64;

    /// Products written into every fetched event
    fn outputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }
}

/// Non-blocking single-holder gate.
#[derive(Debug, Default)]
pub struct FetchGate {
    held: AtomicBool,
}

impl FetchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate, or return `None` immediately if someone else holds it.
    pub fn try_acquire(&self) -> Option<FetchGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FetchGuard { gate: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop, on every exit path.
#[derive(Debug)]
pub struct FetchGuard<'a> {
    gate: &'a FetchGate,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.gate.held.store(false, Ordering::Release);
    }
}

struct SourceSlot {
    source: Box<dyn EventSource>,
    opened: bool,
}

/// Arrow that originates events from an [`EventSource`].
pub struct SourceArrow {
    core: ArrowCore,
    source: Mutex<SourceSlot>,
    output: Arc<Queue<EventHandle>>,
    gate: FetchGate,
    exhausted: AtomicBool,
    backlog: Mutex<VecDeque<EventHandle>>,
    /// Turns between fetch and push
    pending_turns: AtomicUsize,
    min_batch: AtomicUsize,
    max_batch: AtomicUsize,
    policy: FetchErrorPolicy,
    source_tag: Arc<str>,
    application: Arc<str>,
    events_read: AtomicU64,
    tasks_created: AtomicU64,
}

impl SourceArrow {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn EventSource>,
        output: Arc<Queue<EventHandle>>,
        settings: &SourceSettings,
        application: &str,
        parallelism: usize,
    ) -> Self {
        let core = ArrowCore::new(name, parallelism);
        let source_tag: Arc<str> = Arc::from(core.name());
        let arrow = Self {
            core,
            source: Mutex::new(SourceSlot {
                source,
                opened: false,
            }),
            output,
            gate: FetchGate::new(),
            exhausted: AtomicBool::new(false),
            backlog: Mutex::new(VecDeque::new()),
            pending_turns: AtomicUsize::new(0),
            min_batch: AtomicUsize::new(1),
            max_batch: AtomicUsize::new(1),
            policy: settings.fetch_error_policy,
            source_tag,
            application: Arc::from(application),
            events_read: AtomicU64::new(0),
            tasks_created: AtomicU64::new(0),
        };
        arrow.set_batch_bounds(settings.min_batch, settings.max_batch);
        arrow
    }

    /// Constrain how many items a single turn requests.
    ///
    /// `max` is raised to at least 1 and `min` lowered to at most `max`.
    pub fn set_batch_bounds(&self, min: usize, max: usize) {
        let max = max.max(1);
        let min = min.min(max);
        self.max_batch.store(max, Ordering::Release);
        self.min_batch.store(min, Ordering::Release);
    }

    pub fn batch_bounds(&self) -> (usize, usize) {
        (
            self.min_batch.load(Ordering::Acquire),
            self.max_batch.load(Ordering::Acquire),
        )
    }

    /// True once the source reported that no more events will come
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn events_read(&self) -> u64 {
        self.events_read.load(Ordering::Relaxed)
    }

    pub fn tasks_created(&self) -> u64 {
        self.tasks_created.load(Ordering::Relaxed)
    }

    /// Count reported by the source itself
    pub fn events_emitted(&self) -> u64 {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .source
            .events_emitted()
    }

    pub fn gate(&self) -> &FetchGate {
        &self.gate
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fetch up to `max_items` events and turn each into a downstream task.
    ///
    /// Returns an empty batch immediately when the source is exhausted or
    /// another worker holds the fetch gate.
    pub fn get_process_tasks(
        &self,
        max_items: usize,
        pool: &EventPool,
        location: usize,
    ) -> EngineResult<Vec<EventHandle>> {
        if self.is_exhausted() {
            return Ok(Vec::new());
        }
        let Some(gate) = self.gate.try_acquire() else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::with_capacity(max_items);
        let outcome = self.fetch_batch(max_items, pool, location, &mut batch);
        drop(gate);

        self.events_read
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        if let Err(e) = outcome {
            for handle in batch {
                pool.put(handle, location);
            }
            return Err(e);
        }
        self.tasks_created
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch)
    }

    /// Body of the fetch section. Caller holds the gate.
    fn fetch_batch(
        &self,
        max_items: usize,
        pool: &EventPool,
        location: usize,
        batch: &mut Vec<EventHandle>,
    ) -> EngineResult<()> {
        let mut slot = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.opened {
            slot.source
                .open()
                .map_err(|e| EngineError::stage(self.name(), ExecutionPhase::Open, e))?;
            slot.opened = true;
            tracing::debug!("Opened source '{}'", self.name());
        }

        while batch.len() < max_items {
            let Some(handle) = pool.get(location) else {
                tracing::trace!("Source '{}' waiting on the event pool", self.name());
                break;
            };

            let fetched = pool.with_event_mut(&handle, |event| {
                let status = slot.source.fetch(event);
                if matches!(status, Ok(FetchStatus::Ready)) {
                    event.tag(&self.source_tag, &self.application);
                }
                status
            });

            match fetched {
                Ok(FetchStatus::Ready) => batch.push(handle),
                Ok(FetchStatus::NoMoreEvents) => {
                    pool.put(handle, location);
                    self.exhausted.store(true, Ordering::Release);
                    tracing::debug!("Source '{}' exhausted", self.name());
                    break;
                }
                Ok(FetchStatus::Busy) | Ok(FetchStatus::TryAgain) => {
                    pool.put(handle, location);
                    break;
                }
                Err(e) => {
                    pool.put(handle, location);
                    match self.policy {
                        FetchErrorPolicy::StopTurn => {
                            tracing::warn!("Source '{}' fetch failed, retrying later: {:#}", self.name(), e);
                            break;
                        }
                        FetchErrorPolicy::Fatal => {
                            return Err(EngineError::stage(self.name(), ExecutionPhase::Fetch, e));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn flush_backlog(&self, backlog: &mut VecDeque<EventHandle>) {
        while let Some(handle) = backlog.pop_front() {
            if let Err(handle) = self.output.push(handle) {
                backlog.push_front(handle);
                break;
            }
        }
    }

    /// Push parked items while the arrow is not executing.
    ///
    /// Returns true when nothing fetched by this arrow remains undelivered.
    pub(crate) fn try_flush_backlog(&self) -> bool {
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_backlog(&mut backlog);
        backlog.is_empty() && self.pending_turns.load(Ordering::SeqCst) == 0
    }

    /// Nothing more will ever be pushed by this arrow.
    fn stream_done(&self, backlog: &VecDeque<EventHandle>) -> bool {
        self.is_exhausted() && self.pending_turns.load(Ordering::SeqCst) == 0 && backlog.is_empty()
    }
}

impl Arrow for SourceArrow {
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
            if self.stream_done(&backlog) {
                return Ok(StreamStatus::Finished);
            }
        }

        let (min_batch, max_batch) = self.batch_bounds();
        let want = max_batch.min(self.output.free_capacity());
        if want == 0 || want < min_batch.min(self.output.capacity()) {
            return Ok(StreamStatus::ComeBackLater);
        }

        self.pending_turns.fetch_add(1, Ordering::SeqCst);
        let batch = self.get_process_tasks(want, ctx.pool, ctx.location);
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                self.pending_turns.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        let produced = !batch.is_empty();
        for handle in batch {
            if !backlog.is_empty() {
                backlog.push_back(handle);
            } else if let Err(handle) = self.output.push(handle) {
                backlog.push_back(handle);
            }
        }
        self.pending_turns.fetch_sub(1, Ordering::SeqCst);

        if produced {
            Ok(StreamStatus::Success)
        } else if self.stream_done(&backlog) {
            Ok(StreamStatus::Finished)
        } else {
            Ok(StreamStatus::ComeBackLater)
        }
    }

    fn finalize(&self, pool: &EventPool) -> EngineResult<()> {
        {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            self.flush_backlog(&mut backlog);
            if !backlog.is_empty() {
                tracing::warn!(
                    "Source '{}' finished with {} unflushed events; returning them to the pool",
                    self.name(),
                    backlog.len()
                );
                for handle in backlog.drain(..) {
                    pool.put(handle, 0);
                }
            }
        }

        let mut slot = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.opened {
            slot.opened = false;
            slot.source
                .close()
                .map_err(|e| EngineError::stage(self.name(), ExecutionPhase::Finalize, e))?;
        }
        Ok(())
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .source
            .outputs()
    }

    fn as_source(&self) -> Option<&SourceArrow> {
        Some(self)
    }
}
