//! Load-generating plugins for demos, benchmarks and tests.
//!
//! - [`SyntheticSource`] emits a fixed number of events, each carrying a
//!   deterministic `hits` payload (`Vec<f64>`).
//! - [`BusyStage`] burns a configurable amount of CPU per event and writes
//!   the summed payload as `energy` (`f64`).

use crate::engine::port::PortDescriptor;
use crate::engine::source::{EventSource, FetchStatus};
use crate::engine::stage::Stage;
use crate::pool::Event;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Product written by [`SyntheticSource`]
pub const HITS_PRODUCT: &str = "hits";
/// Product written by [`BusyStage`]
pub const ENERGY_PRODUCT: &str = "energy";

const DEFAULT_PAYLOAD_LEN: usize = 16;

/// Source emitting `limit` numbered events, then no more.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    limit: u64,
    emitted: u64,
    events_per_run: u64,
    first_run: i32,
    payload_len: usize,
}

impl SyntheticSource {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            emitted: 0,
            events_per_run: u64::MAX,
            first_run: 1,
            payload_len: DEFAULT_PAYLOAD_LEN,
        }
    }

    /// Start a new run number every `n` events
    pub fn with_events_per_run(mut self, n: u64) -> Self {
        self.events_per_run = n.max(1);
        self
    }

    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    fn payload(&self, event_number: u64) -> Vec<f64> {
        (0..self.payload_len as u64)
            .map(|i| ((event_number.wrapping_mul(31).wrapping_add(i)) % 97) as f64 / 10.0)
            .collect()
    }
}

impl EventSource for SyntheticSource {
    fn open(&mut self) -> anyhow::Result<()> {
        tracing::debug!("Synthetic source opened, {} events", self.limit);
        Ok(())
    }

    fn fetch(&mut self, event: &mut Event) -> anyhow::Result<FetchStatus> {
        if self.emitted >= self.limit {
            return Ok(FetchStatus::NoMoreEvents);
        }
        let event_number = self.emitted + 1;
        let run_offset = (self.emitted / self.events_per_run).min(i32::MAX as u64) as i32;
        event.set_event_number(event_number);
        event.set_run_number(self.first_run.saturating_add(run_offset));
        event.insert(HITS_PRODUCT, self.payload(event_number));
        self.emitted = event_number;
        Ok(FetchStatus::Ready)
    }

    fn events_emitted(&self) -> u64 {
        self.emitted
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::output::<Vec<f64>>(HITS_PRODUCT)]
    }
}

/// Stage spinning for a fixed time per event.
#[derive(Debug)]
pub struct BusyStage {
    spin: Duration,
    processed: AtomicU64,
    runs_seen: u64,
}

impl BusyStage {
    pub fn new(spin: Duration) -> Self {
        Self {
            spin,
            processed: AtomicU64::new(0),
            runs_seen: 0,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl Stage for BusyStage {
    fn name(&self) -> &str {
        "busy"
    }

    fn inputs(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input::<Vec<f64>>(HITS_PRODUCT)]
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::output::<f64>(ENERGY_PRODUCT)]
    }

    fn change_run(&mut self, run_number: i32) -> anyhow::Result<()> {
        self.runs_seen += 1;
        tracing::trace!("Busy stage entering run {}", run_number);
        Ok(())
    }

    fn execute(&self, _run_number: i32, event_number: u64, event: &mut Event) -> anyhow::Result<()> {
        let energy: f64 = event
            .get::<Vec<f64>>(HITS_PRODUCT)
            .ok_or_else(|| anyhow::anyhow!("event {} has no '{}' product", event_number, HITS_PRODUCT))?
            .iter()
            .sum();

        let started = Instant::now();
        let mut acc = energy;
        while started.elapsed() < self.spin {
            acc = black_box(acc.sqrt() + 1.0);
        }
        black_box(acc);

        event.insert(ENERGY_PRODUCT, energy);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        tracing::debug!(
            "Busy stage processed {} events over {} runs",
            self.processed(),
            self.runs_seen
        );
        Ok(())
    }
}
