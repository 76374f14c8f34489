//! Test plugins: instrumented sources, recording stages and a gauge arrow

use eventflow::engine::{
    Arrow, ArrowCore, EventSource, ExecutionContext, FetchStatus, PortDescriptor, Queue, Stage,
};
use eventflow::pool::{Event, EventHandle};
use eventflow::{EngineResult, StreamStatus};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const COUNT_PRODUCT: &str = "count";

/// Counters shared between a [`CountingSource`] and the test body.
#[derive(Debug, Default)]
pub struct FetchTracker {
    inside: AtomicUsize,
    max_inside: AtomicUsize,
    fetches: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl FetchTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of threads observed inside `fetch` at once
    pub fn max_inside(&self) -> usize {
        self.max_inside.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Source emitting events numbered `1..=limit`, each carrying its number as
/// the `count` product.
pub struct CountingSource {
    emitted: u64,
    limit: u64,
    tracker: Arc<FetchTracker>,
    fetch_delay: Duration,
}

impl CountingSource {
    pub fn new(limit: u64) -> Self {
        Self::tracked(limit, FetchTracker::new())
    }

    pub fn tracked(limit: u64, tracker: Arc<FetchTracker>) -> Self {
        Self {
            emitted: 0,
            limit,
            tracker,
            fetch_delay: Duration::ZERO,
        }
    }

    /// Sleep inside every fetch, widening the window for overlapping callers
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }
}

impl EventSource for CountingSource {
    fn open(&mut self) -> anyhow::Result<()> {
        self.tracker.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch(&mut self, event: &mut Event) -> anyhow::Result<FetchStatus> {
        let now = self.tracker.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.max_inside.fetch_max(now, Ordering::SeqCst);
        self.tracker.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            thread::sleep(self.fetch_delay);
        }

        let status = if self.emitted >= self.limit {
            FetchStatus::NoMoreEvents
        } else {
            self.emitted += 1;
            event.set_run_number(1);
            event.set_event_number(self.emitted);
            event.insert(COUNT_PRODUCT, self.emitted);
            FetchStatus::Ready
        };

        self.tracker.inside.fetch_sub(1, Ordering::SeqCst);
        Ok(status)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.tracker.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn events_emitted(&self) -> u64 {
        self.emitted
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::output::<u64>(COUNT_PRODUCT)]
    }
}

/// Everything a [`RecordingStage`] observed.
#[derive(Debug, Default)]
pub struct StageLog {
    events: Mutex<Vec<u64>>,
    runs: Mutex<Vec<i32>>,
    started: AtomicU64,
    completed: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
    configured: AtomicU64,
    finished: AtomicU64,
}

impl StageLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Event numbers in execution order
    pub fn events(&self) -> Vec<u64> {
        self.events.lock().unwrap().clone()
    }

    pub fn executions(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn runs(&self) -> Vec<i32> {
        self.runs.lock().unwrap().clone()
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `execute` calls observed
    pub fn max_concurrent(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn configured(&self) -> u64 {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    /// Each of `1..=n` seen exactly once
    pub fn saw_each_once(&self, n: u64) -> bool {
        let events = self.events();
        let unique: HashSet<u64> = events.iter().copied().collect();
        events.len() as u64 == n && unique.len() as u64 == n && (1..=n).all(|i| unique.contains(&i))
    }
}

/// Stage logging every call, optionally sleeping or failing.
pub struct RecordingStage {
    name: String,
    log: Arc<StageLog>,
    delay: Duration,
    fail_at: Option<u64>,
}

impl RecordingStage {
    pub fn new(name: impl Into<String>, log: Arc<StageLog>) -> Self {
        Self {
            name: name.into(),
            log,
            delay: Duration::ZERO,
            fail_at: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail when processing event number `event_number`
    pub fn failing_at(mut self, event_number: u64) -> Self {
        self.fail_at = Some(event_number);
        self
    }
}

impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> anyhow::Result<()> {
        self.log.configured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn change_run(&mut self, run_number: i32) -> anyhow::Result<()> {
        self.log.runs.lock().unwrap().push(run_number);
        Ok(())
    }

    fn execute(&self, _run_number: i32, event_number: u64, _event: &mut Event) -> anyhow::Result<()> {
        self.log.started.fetch_add(1, Ordering::SeqCst);
        let live = self.log.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_live.fetch_max(live, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.log.live.fetch_sub(1, Ordering::SeqCst);

        if self.fail_at == Some(event_number) {
            self.log.completed.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("refusing event {}", event_number);
        }
        self.log.events.lock().unwrap().push(event_number);
        self.log.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.log.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counters shared between a [`GaugeSink`] and the test body.
#[derive(Debug, Clone, Default)]
pub struct GaugeCounters {
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    consumed: Arc<AtomicU64>,
}

impl GaugeCounters {
    /// Highest number of overlapping executions observed
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }
}

/// Sink arrow measuring how many of its executions overlap.
pub struct GaugeSink {
    core: ArrowCore,
    input: Arc<Queue<EventHandle>>,
    counters: GaugeCounters,
    delay: Duration,
}

impl GaugeSink {
    pub fn new(
        name: &str,
        input: Arc<Queue<EventHandle>>,
        parallelism: usize,
        delay: Duration,
        counters: GaugeCounters,
    ) -> Self {
        Self {
            core: ArrowCore::new(name, parallelism),
            input,
            counters,
            delay,
        }
    }
}

impl Arrow for GaugeSink {
    fn core(&self) -> &ArrowCore {
        &self.core
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> EngineResult<StreamStatus> {
        let now = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(now, Ordering::SeqCst);

        let status = match self.input.pop() {
            Some(handle) => {
                thread::sleep(self.delay);
                ctx.pool.put(handle, ctx.location);
                self.counters.consumed.fetch_add(1, Ordering::SeqCst);
                StreamStatus::Success
            }
            None if self.input.is_drained() => StreamStatus::Finished,
            None => StreamStatus::ComeBackLater,
        };

        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        Ok(status)
    }
}
