//! Topology: the owned graph of arrows and queues plus its lifecycle.
//!
//! ```text
//!            run()                 request_pause()
//!   Paused ─────────▶ Running ───────────────────▶ Pausing
//!     ▲                 │  │                          │
//!     │   achieve_pause │  │ drain()                  │ achieve_pause
//!     └─────────────────┘  ▼                          │
//!     ◀──────────────── Draining ◀────────────────────┘
//!     │  finish()
//!     ▼
//!   Finished
//! ```
//!
//! Transitions that may log or allocate are serialized by a transition
//! mutex. `drain()` is the exception: it only flips atomics and calls the
//! non-blocking `pause()` on source arrows, so it can be invoked from a
//! signal handler.

use crate::config::{EngineConfig, SourceSettings, TopologySettings};
use crate::engine::arrow::Arrow;
use crate::engine::id::{ArrowId, QueueId};
use crate::engine::metrics::{ArrowMetricsSnapshot, TopologyMetrics};
use crate::engine::port::PortDescriptor;
use crate::engine::queue::Queue;
use crate::engine::source::{EventSource, SourceArrow};
use crate::engine::stage::{Stage, StageArrow};
use crate::error::{EngineError, EngineResult};
use crate::pool::{EventHandle, EventPool};
use crate::types::TopologyStatus;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Graph of arrows and queues with a global lifecycle.
pub struct Topology {
    arrows: Vec<Box<dyn Arrow>>,
    queues: Vec<Arc<Queue<EventHandle>>>,
    outputs_of: Vec<Vec<QueueId>>,
    /// Arrows fed by each arrow's outputs
    downstream: Vec<Vec<ArrowId>>,
    /// Activated by `run()`: everything reachable from an input-less arrow
    reachable: Vec<bool>,
    sources: Vec<ArrowId>,
    pool: Arc<EventPool>,
    status: AtomicU8,
    transition_lock: Mutex<()>,
    metrics: TopologyMetrics,
}

impl Topology {
    pub fn status(&self) -> TopologyStatus {
        TopologyStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// CAS `from -> to` and log it. Caller holds the transition lock.
    fn transition(&self, from: TopologyStatus, to: TopologyStatus) -> bool {
        let ok = self
            .status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.metrics.record_transition(from, to);
            tracing::debug!("Topology {} -> {}", from, to);
        }
        ok
    }

    /// Start (or resume) processing with `nthreads` workers.
    ///
    /// No-op when already Running or Finished. Returns true if the topology
    /// moved to Running.
    pub fn run(&self, nthreads: usize) -> bool {
        let _lock = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.status();
        if matches!(current, TopologyStatus::Running | TopologyStatus::Finished) {
            return false;
        }

        // End-of-stream seen downstream of a source that can still produce
        // (e.g. after drain()) is not final.
        for (idx, live) in self.fed_by_live_source().into_iter().enumerate() {
            let arrow = &self.arrows[idx];
            if live && arrow.core().clear_stream_finished() {
                tracing::debug!("Arrow '{}' resumes after an interrupted stream", arrow.name());
            }
        }
        for (idx, arrow) in self.arrows.iter().enumerate() {
            if self.reachable[idx] && !arrow.core().is_stream_finished() && arrow.core().reopen_outputs() {
                for queue in &self.outputs_of[idx] {
                    self.queues[queue.index()].producer_resumed();
                }
            }
        }
        for &source in &self.sources {
            self.arrows[source.index()].run();
        }
        for (idx, arrow) in self.arrows.iter().enumerate() {
            if self.reachable[idx] {
                arrow.run();
            }
        }

        for arrow in &self.arrows {
            arrow.core().metrics().reset();
        }
        self.metrics.reset();
        self.metrics.start(nthreads);

        if !self.transition(current, TopologyStatus::Running) {
            // drain() won the race; its pause of the sources stands
            tracing::warn!("Topology status changed during run(); now {}", self.status());
            return false;
        }
        tracing::info!(
            "Topology running: {} arrows, {} sources, {} threads",
            self.arrows.len(),
            self.sources.len(),
            nthreads
        );
        true
    }

    /// Cooperative cancellation: Running -> Pausing, pausing every arrow.
    ///
    /// In-flight executions complete; no new ones start.
    pub fn request_pause(&self) -> bool {
        let _lock = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status() != TopologyStatus::Running {
            return false;
        }
        for arrow in &self.arrows {
            arrow.pause();
        }
        let ok = self.transition(TopologyStatus::Running, TopologyStatus::Pausing);
        if ok {
            tracing::info!("Topology pause requested");
        }
        ok
    }

    /// Pause every arrow regardless of topology status.
    ///
    /// Used to stop the graph after a fatal failure, when `request_pause`
    /// may not apply (e.g. while Draining).
    pub fn pause_all_arrows(&self) {
        for arrow in &self.arrows {
            arrow.pause();
        }
    }

    /// Confirm that no worker holds an execution slot: Running, Pausing or
    /// Draining -> Paused, stopping the metrics window.
    ///
    /// Refused (returns false) while any arrow still has active executions.
    pub fn achieve_pause(&self) -> bool {
        let _lock = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.achieve_pause_locked()
    }

    fn achieve_pause_locked(&self) -> bool {
        let current = self.status();
        if !matches!(
            current,
            TopologyStatus::Running | TopologyStatus::Pausing | TopologyStatus::Draining
        ) {
            return false;
        }
        let active = self.active_executions();
        if active > 0 {
            tracing::debug!("Cannot achieve pause yet: {} active executions", active);
            return false;
        }
        self.metrics.stop();
        let ok = self.transition(current, TopologyStatus::Paused);
        if ok {
            tracing::info!("Topology paused after {:?}", self.metrics.uptime());
        }
        ok
    }

    /// Automatic pause once nothing is Running and nothing is executing.
    ///
    /// Called by the scheduler while it holds its own mutex.
    pub(crate) fn achieve_pause_if_quiescent(&self) -> bool {
        let current = self.status();
        if !matches!(
            current,
            TopologyStatus::Running | TopologyStatus::Pausing | TopologyStatus::Draining
        ) {
            return false;
        }
        if self.arrows.iter().any(|a| a.core().is_running()) {
            return false;
        }
        let _lock = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the lock: run() may have restarted arrows.
        if self.arrows.iter().any(|a| a.core().is_running()) {
            return false;
        }
        self.achieve_pause_locked()
    }

    /// Stop intake and let in-flight work finish. Never blocks or logs.
    pub fn drain(&self) {
        loop {
            let current = self.status();
            if matches!(current, TopologyStatus::Finished | TopologyStatus::Draining) {
                return;
            }
            for &source in &self.sources {
                self.arrows[source.index()].pause();
            }
            if self
                .status
                .compare_exchange(
                    current.as_u8(),
                    TopologyStatus::Draining.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.metrics.note_drain(current);
                return;
            }
        }
    }

    /// Finalize every arrow exactly once: Paused -> Finished.
    ///
    /// No-op when already Finished. Any other status is a protocol
    /// violation. The first finalize failure is returned after all arrows
    /// have been finished.
    pub fn finish(&self) -> EngineResult<()> {
        let _lock = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.status() {
            TopologyStatus::Finished => return Ok(()),
            TopologyStatus::Paused => {}
            other => {
                return Err(EngineError::ProtocolViolation(format!(
                    "finish() requires a Paused topology, status is {}",
                    other
                )))
            }
        }

        let mut first_error = None;
        for arrow in &self.arrows {
            arrow.pause();
            if let Err(e) = arrow.finish(&self.pool) {
                tracing::error!("Failed to finish arrow '{}': {}", arrow.name(), e);
                first_error.get_or_insert(e);
            }
        }
        self.transition(TopologyStatus::Paused, TopologyStatus::Finished);
        tracing::info!("Topology finished");
        first_error.map_or(Ok(()), Err)
    }

    /// Arrows downstream of a source that is not exhausted
    fn fed_by_live_source(&self) -> Vec<bool> {
        let mut live = vec![false; self.arrows.len()];
        let mut frontier: VecDeque<usize> = self
            .sources
            .iter()
            .filter(|id| {
                self.arrows[id.index()]
                    .as_source()
                    .is_some_and(|source| !source.is_exhausted())
            })
            .map(|id| id.index())
            .collect();
        while let Some(a) = frontier.pop_front() {
            for b in &self.downstream[a] {
                if !live[b.index()] {
                    live[b.index()] = true;
                    frontier.push_back(b.index());
                }
            }
        }
        live
    }

    /// Tell `id`'s output queues that this producer is done (once).
    pub(crate) fn close_outputs(&self, id: ArrowId) {
        if self.arrows[id.index()].core().close_outputs() {
            for queue in &self.outputs_of[id.index()] {
                self.queues[queue.index()].producer_finished();
            }
            tracing::debug!("Closed outputs of arrow '{}'", self.arrows[id.index()].name());
        }
    }

    pub fn arrow(&self, id: ArrowId) -> Option<&dyn Arrow> {
        self.arrows.get(id.index()).map(|a| a.as_ref())
    }

    pub fn arrows(&self) -> &[Box<dyn Arrow>] {
        &self.arrows
    }

    pub fn arrow_id(&self, name: &str) -> Option<ArrowId> {
        self.arrows
            .iter()
            .position(|a| a.name() == name)
            .map(|i| ArrowId(i as u32))
    }

    pub fn queue(&self, id: QueueId) -> Option<&Arc<Queue<EventHandle>>> {
        self.queues.get(id.index())
    }

    pub fn queues(&self) -> &[Arc<Queue<EventHandle>>] {
        &self.queues
    }

    pub fn sources(&self) -> &[ArrowId] {
        &self.sources
    }

    pub fn is_source(&self, id: ArrowId) -> bool {
        self.sources.contains(&id)
    }

    /// Arrows consuming `id`'s outputs
    pub fn downstream(&self, id: ArrowId) -> &[ArrowId] {
        &self.downstream[id.index()]
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &TopologyMetrics {
        &self.metrics
    }

    /// Sum of active executions across all arrows
    pub fn active_executions(&self) -> usize {
        self.arrows.iter().map(|a| a.core().active_executions()).sum()
    }

    /// True once every source reported no more events
    pub fn sources_exhausted(&self) -> bool {
        self.source_arrows().all(SourceArrow::is_exhausted)
    }

    pub fn events_read(&self) -> u64 {
        self.source_arrows().map(SourceArrow::events_read).sum()
    }

    pub fn tasks_created(&self) -> u64 {
        self.source_arrows().map(SourceArrow::tasks_created).sum()
    }

    fn source_arrows(&self) -> impl Iterator<Item = &SourceArrow> {
        self.sources
            .iter()
            .filter_map(|id| self.arrows[id.index()].as_source())
    }

    pub fn arrow_metrics(&self) -> Vec<ArrowMetricsSnapshot> {
        let uptime = self.metrics.uptime();
        self.arrows
            .iter()
            .map(|a| {
                let core = a.core();
                core.metrics().snapshot(
                    core.name(),
                    core.status(),
                    core.active_executions(),
                    core.parallelism(),
                    uptime,
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("status", &self.status())
            .field("arrows", &self.arrows.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("queues", &self.queues)
            .finish()
    }
}

/// Assembles and validates a [`Topology`].
pub struct TopologyBuilder {
    settings: TopologySettings,
    source_settings: SourceSettings,
    application: String,
    pool: Arc<EventPool>,
    queues: Vec<Arc<Queue<EventHandle>>>,
    arrows: Vec<Box<dyn Arrow>>,
    inputs_of: Vec<Vec<QueueId>>,
    outputs_of: Vec<Vec<QueueId>>,
}

impl TopologyBuilder {
    pub fn new(config: &EngineConfig, pool: Arc<EventPool>) -> Self {
        Self {
            settings: config.topology.clone(),
            source_settings: config.source.clone(),
            application: config.application_name.clone(),
            pool,
            queues: Vec::new(),
            arrows: Vec::new(),
            inputs_of: Vec::new(),
            outputs_of: Vec::new(),
        }
    }

    /// Add a queue with the configured default capacity
    pub fn add_queue(&mut self, name: impl Into<String>) -> QueueId {
        let capacity = self.settings.queue_capacity.max(1);
        self.push_queue(name.into(), capacity)
    }

    pub fn add_queue_with_capacity(
        &mut self,
        name: impl Into<String>,
        capacity: usize,
    ) -> EngineResult<QueueId> {
        let name = name.into();
        if capacity == 0 {
            return Err(EngineError::Topology(format!(
                "queue '{}' must have a capacity of at least 1",
                name
            )));
        }
        Ok(self.push_queue(name, capacity))
    }

    fn push_queue(&mut self, name: String, capacity: usize) -> QueueId {
        let id = QueueId(self.queues.len() as u32);
        self.queues.push(Arc::new(Queue::with_policy(
            name,
            capacity,
            self.settings.push_policy,
            self.settings.push_timeout(),
        )));
        id
    }

    /// Shared handle to a queue, for wiring custom arrows
    pub fn queue(&self, id: QueueId) -> EngineResult<Arc<Queue<EventHandle>>> {
        self.queues
            .get(id.index())
            .cloned()
            .ok_or_else(|| EngineError::Topology(format!("unknown queue {}", id)))
    }

    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        source: Box<dyn EventSource>,
        output: QueueId,
    ) -> EngineResult<ArrowId> {
        let queue = self.queue(output)?;
        let arrow = SourceArrow::new(
            name,
            source,
            queue,
            &self.source_settings,
            &self.application,
            self.settings.default_parallelism,
        );
        self.add_arrow(Box::new(arrow), &[], &[output])
    }

    /// Add a stage arrow. `output: None` makes it a sink.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        input: QueueId,
        output: Option<QueueId>,
        stages: Vec<Box<dyn Stage>>,
    ) -> EngineResult<ArrowId> {
        let input_queue = self.queue(input)?;
        let output_queue = output.map(|id| self.queue(id)).transpose()?;
        let arrow = StageArrow::new(
            name,
            input_queue,
            output_queue,
            stages,
            self.settings.default_parallelism,
        );
        let outputs: Vec<QueueId> = output.into_iter().collect();
        self.add_arrow(Box::new(arrow), &[input], &outputs)
    }

    pub fn add_sink(
        &mut self,
        name: impl Into<String>,
        input: QueueId,
        stages: Vec<Box<dyn Stage>>,
    ) -> EngineResult<ArrowId> {
        self.add_stage(name, input, None, stages)
    }

    /// Add any arrow, declaring the queues it reads from and writes to.
    pub fn add_arrow(
        &mut self,
        arrow: Box<dyn Arrow>,
        inputs: &[QueueId],
        outputs: &[QueueId],
    ) -> EngineResult<ArrowId> {
        for id in inputs.iter().chain(outputs) {
            if id.index() >= self.queues.len() {
                return Err(EngineError::Topology(format!(
                    "arrow '{}' refers to unknown queue {}",
                    arrow.name(),
                    id
                )));
            }
        }
        if self.arrows.iter().any(|a| a.name() == arrow.name()) {
            return Err(EngineError::Topology(format!(
                "duplicate arrow name '{}'",
                arrow.name()
            )));
        }
        let id = ArrowId(self.arrows.len() as u32);
        self.arrows.push(arrow);
        self.inputs_of.push(inputs.to_vec());
        self.outputs_of.push(outputs.to_vec());
        Ok(id)
    }

    pub fn set_parallelism(&mut self, id: ArrowId, parallelism: usize) -> EngineResult<()> {
        let arrow = self.arrow(id)?;
        if parallelism == 0 {
            return Err(EngineError::Topology(format!(
                "arrow '{}' needs a parallelism of at least 1",
                arrow.name()
            )));
        }
        arrow.core().set_parallelism(parallelism);
        Ok(())
    }

    pub fn set_batch_bounds(&mut self, id: ArrowId, min: usize, max: usize) -> EngineResult<()> {
        let arrow = self.arrow(id)?;
        let source = arrow.as_source().ok_or_else(|| {
            EngineError::Topology(format!("arrow '{}' is not a source", arrow.name()))
        })?;
        source.set_batch_bounds(min, max);
        Ok(())
    }

    fn arrow(&self, id: ArrowId) -> EngineResult<&dyn Arrow> {
        self.arrows
            .get(id.index())
            .map(|a| a.as_ref())
            .ok_or_else(|| EngineError::Topology(format!("unknown arrow {}", id)))
    }

    /// Validate the graph and produce a Paused topology.
    pub fn build(self) -> EngineResult<Topology> {
        let n = self.arrows.len();
        if n == 0 {
            return Err(EngineError::Topology("topology has no arrows".to_string()));
        }

        let mut producers: Vec<Vec<usize>> = vec![Vec::new(); self.queues.len()];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); self.queues.len()];
        for a in 0..n {
            for q in &self.outputs_of[a] {
                producers[q.index()].push(a);
            }
            for q in &self.inputs_of[a] {
                consumers[q.index()].push(a);
            }
        }
        for (q, queue) in self.queues.iter().enumerate() {
            if consumers[q].is_empty() {
                return Err(EngineError::Topology(format!(
                    "queue '{}' has no consumer",
                    queue.name()
                )));
            }
            if producers[q].is_empty() {
                tracing::warn!("Queue '{}' has no producer; its consumers will see end-of-stream", queue.name());
            }
        }

        let mut downstream: Vec<Vec<ArrowId>> = vec![Vec::new(); n];
        let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); n];
        for a in 0..n {
            let mut seen = HashSet::new();
            for q in &self.outputs_of[a] {
                for &b in &consumers[q.index()] {
                    if seen.insert(b) {
                        downstream[a].push(ArrowId(b as u32));
                        upstream[b].push(a);
                    }
                }
            }
        }

        let order = topological_order(&downstream).ok_or_else(|| {
            EngineError::Topology("arrow graph contains a cycle".to_string())
        })?;

        // Products available on events reaching each arrow.
        let mut produced: Vec<Vec<PortDescriptor>> = vec![Vec::new(); n];
        for &a in &order {
            let mut available: Vec<PortDescriptor> = Vec::new();
            for &p in &upstream[a] {
                for port in &produced[p] {
                    if !available.contains(port) {
                        available.push(port.clone());
                    }
                }
            }
            for input in self.arrows[a].inputs() {
                if !available.iter().any(|out| input.accepts(out)) {
                    return Err(EngineError::PortMismatch(format!(
                        "arrow '{}' consumes '{}' ({}) which nothing upstream produces",
                        self.arrows[a].name(),
                        input.name,
                        input.type_name
                    )));
                }
            }
            for port in self.arrows[a].outputs() {
                if !available.contains(&port) {
                    available.push(port);
                }
            }
            produced[a] = available;
        }

        for a in 0..n {
            for q in &self.outputs_of[a] {
                self.queues[q.index()].register_producer();
            }
        }

        let mut reachable = vec![false; n];
        let mut frontier: VecDeque<usize> = (0..n).filter(|&a| self.inputs_of[a].is_empty()).collect();
        for &a in &frontier {
            reachable[a] = true;
        }
        while let Some(a) = frontier.pop_front() {
            for b in &downstream[a] {
                if !reachable[b.index()] {
                    reachable[b.index()] = true;
                    frontier.push_back(b.index());
                }
            }
        }

        let sources: Vec<ArrowId> = (0..n)
            .filter(|&a| self.arrows[a].as_source().is_some())
            .map(|a| ArrowId(a as u32))
            .collect();

        let topology = Topology {
            arrows: self.arrows,
            queues: self.queues,
            outputs_of: self.outputs_of,
            downstream,
            reachable,
            sources,
            pool: self.pool,
            status: AtomicU8::new(TopologyStatus::Paused.as_u8()),
            transition_lock: Mutex::new(()),
            metrics: TopologyMetrics::new(),
        };

        for (a, arrow) in topology.arrows.iter().enumerate() {
            if !topology.reachable[a] {
                tracing::warn!("Arrow '{}' is not reachable from any source and will never run", arrow.name());
                topology.close_outputs(ArrowId(a as u32));
            }
        }

        tracing::info!(
            "Topology built: {} arrows, {} queues, {} sources",
            topology.arrows.len(),
            topology.queues.len(),
            topology.sources.len()
        );
        Ok(topology)
    }
}

/// Kahn's algorithm over arrow adjacency; `None` if the graph has a cycle.
fn topological_order(downstream: &[Vec<ArrowId>]) -> Option<Vec<usize>> {
    let n = downstream.len();
    let mut in_degree = vec![0u32; n];
    for edges in downstream {
        for b in edges {
            in_degree[b.index()] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(a) = queue.pop_front() {
        order.push(a);
        for b in &downstream[a] {
            in_degree[b.index()] -= 1;
            if in_degree[b.index()] == 0 {
                queue.push_back(b.index());
            }
        }
    }

    (order.len() == n).then_some(order)
}
