//! Engine controller: owns the worker threads driving a topology.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = Engine::new(topology, config);
//! engine.run(4)?;
//! engine.wait_until_paused(None)?;   // natural end of stream
//! engine.finish()?;
//! println!("{:.1} Hz", engine.metrics().throughput_hz());
//! ```

use crate::config::EngineConfig;
use crate::engine::id::WorkerId;
use crate::engine::metrics::MetricsReport;
use crate::engine::scheduler::Scheduler;
use crate::engine::topology::Topology;
use crate::engine::worker::{Worker, WorkerReport, WorkerStats};
use crate::error::{EngineError, EngineResult};
use crate::types::TopologyStatus;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const REPORT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Cloneable handle that can drain the topology from any thread.
///
/// `drain()` performs no blocking calls, so it is safe to invoke from a
/// signal handler context.
#[derive(Debug, Clone)]
pub struct DrainHandle {
    topology: Arc<Topology>,
}

impl DrainHandle {
    pub fn drain(&self) {
        self.topology.drain();
    }
}

/// Drives a [`Topology`] with a pool of worker threads.
pub struct Engine {
    topology: Arc<Topology>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<WorkerStats>>,
    report_tx: Sender<WorkerReport>,
    report_rx: Receiver<WorkerReport>,
    worker_stats: Vec<WorkerStats>,
}

impl Engine {
    pub fn new(topology: Topology, config: EngineConfig) -> Self {
        let (report_tx, report_rx) = unbounded();
        Self {
            topology: Arc::new(topology),
            config,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            report_tx,
            report_rx,
            worker_stats: Vec::new(),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> TopologyStatus {
        self.topology.status()
    }

    /// Number of live worker threads
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Start (or resume) the topology with `nthreads` workers.
    ///
    /// Any existing workers are stopped first, so this also rescales the
    /// pool. A Finished topology is left untouched.
    pub fn run(&mut self, nthreads: usize) -> EngineResult<()> {
        if nthreads == 0 {
            return Err(EngineError::Config(
                "at least one worker thread is required".to_string(),
            ));
        }
        if self.topology.status() == TopologyStatus::Finished {
            tracing::warn!("run() ignored: topology already finished");
            return Ok(());
        }
        self.stop_workers()?;

        let scheduler = Arc::new(Scheduler::new(Arc::clone(&self.topology), nthreads));
        self.running = Arc::new(AtomicBool::new(true));
        self.topology.run(nthreads);

        for i in 0..nthreads {
            let worker = Worker::new(
                WorkerId(i as u32),
                Arc::clone(&scheduler),
                Arc::clone(&self.running),
                self.report_tx.clone(),
                &self.config.workers,
            );
            let handle = thread::Builder::new()
                .name(format!("eventflow-worker-{}", i))
                .spawn(move || worker.run())
                .map_err(|e| EngineError::Worker(format!("failed to spawn worker {}: {}", i, e)))?;
            self.workers.push(handle);
        }
        tracing::info!("Started {} worker threads", nthreads);
        Ok(())
    }

    /// Cooperative cancellation; see [`Topology::request_pause`].
    pub fn request_pause(&self) -> bool {
        self.topology.request_pause()
    }

    /// Stop intake and let in-flight work drain; never blocks.
    pub fn drain(&self) {
        self.topology.drain();
    }

    pub fn drain_handle(&self) -> DrainHandle {
        DrainHandle {
            topology: Arc::clone(&self.topology),
        }
    }

    /// Block until the topology is Paused (or Finished), a worker reports a
    /// fatal failure, or `timeout` elapses.
    ///
    /// On failure the whole graph is paused and the first failure is
    /// returned once the pause completes. On timeout the current status is
    /// returned.
    pub fn wait_until_paused(&mut self, timeout: Option<Duration>) -> EngineResult<TopologyStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut failure: Option<EngineError> = None;

        loop {
            let status = self.topology.status();
            if matches!(status, TopologyStatus::Paused | TopologyStatus::Finished) {
                break;
            }
            if self.workers.is_empty() && !self.topology.achieve_pause() {
                return Err(EngineError::ProtocolViolation(
                    "cannot wait for a pause with no workers and executions still active".to_string(),
                ));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!("Timed out waiting for pause, topology is {}", status);
                return Ok(status);
            }

            match self.report_rx.recv_timeout(REPORT_POLL_INTERVAL) {
                Ok(WorkerReport::Failure { worker, error }) => {
                    if failure.is_none() {
                        tracing::error!("Aborting run after failure on {}: {}", worker, error);
                        self.topology.request_pause();
                        self.topology.pause_all_arrows();
                        failure = Some(error);
                    } else {
                        tracing::warn!("Additional failure on {}: {}", worker, error);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(self.topology.status()),
        }
    }

    /// Stop and join every worker thread. The topology status is unchanged.
    pub fn stop_workers(&mut self) -> EngineResult<()> {
        if self.workers.is_empty() {
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        let mut result = Ok(());
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(stats) => self.worker_stats.push(stats),
                Err(_) => {
                    result = Err(EngineError::Worker("worker thread panicked".to_string()));
                }
            }
        }
        tracing::debug!("All worker threads joined");
        result
    }

    /// Stop workers and finalize the topology. Requires a Paused topology.
    pub fn finish(&mut self) -> EngineResult<()> {
        self.stop_workers()?;
        self.topology.finish()
    }

    /// Run with `nthreads` until the sources are exhausted and the graph
    /// pauses, then finish and return the final report.
    pub fn run_to_completion(&mut self, nthreads: usize) -> EngineResult<MetricsReport> {
        self.run(nthreads)?;
        let waited = self.wait_until_paused(None);
        if let Err(e) = waited {
            self.stop_workers()?;
            return Err(e);
        }
        self.finish()?;
        Ok(self.metrics())
    }

    /// Snapshot of topology, arrow, source and (exited) worker metrics
    pub fn metrics(&self) -> MetricsReport {
        let metrics = self.topology.metrics();
        MetricsReport {
            status: self.topology.status(),
            started_at: metrics.started_at(),
            stopped_at: metrics.stopped_at(),
            uptime: metrics.uptime(),
            thread_count: metrics.thread_count(),
            events_read: self.topology.events_read(),
            tasks_created: self.topology.tasks_created(),
            events_in_flight: self.topology.pool().in_flight(),
            arrows: self.topology.arrow_metrics(),
            workers: self.worker_stats.clone(),
            transitions: metrics.transitions(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Never finish here: teardown after a failed finalize must not run twice.
        if let Err(e) = self.stop_workers() {
            tracing::error!("Error stopping workers on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("status", &self.topology.status())
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::engine::topology::TopologyBuilder;
    use crate::pool::EventPool;
    use crate::synthetic::{BusyStage, SyntheticSource};

    fn engine(events: u64) -> Engine {
        let config = EngineConfig::default();
        let pool = Arc::new(EventPool::new(&PoolSettings::default()).unwrap());
        let mut b = TopologyBuilder::new(&config, pool);
        let q = b.add_queue("events");
        b.add_source("gen", Box::new(SyntheticSource::new(events)), q).unwrap();
        b.add_sink("busy", q, vec![Box::new(BusyStage::new(Duration::ZERO))]).unwrap();
        Engine::new(b.build().unwrap(), config)
    }

    #[test]
    fn test_run_to_completion() {
        let mut engine = engine(50);
        let report = engine.run_to_completion(2).unwrap();
        assert_eq!(report.status, TopologyStatus::Finished);
        assert_eq!(report.events_read, 50);
        assert_eq!(report.arrow("busy").unwrap().successes, 50);
        assert_eq!(report.events_in_flight, 0);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(engine.worker_count(), 0);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut engine = engine(1);
        assert!(matches!(engine.run(0), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_finish_while_running_is_rejected() {
        let mut engine = engine(1_000_000);
        engine.run(1).unwrap();
        let err = engine.finish().unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
        // Workers are stopped; the topology can still be paused by hand.
        assert_eq!(engine.worker_count(), 0);
        engine.request_pause();
        assert!(engine.topology().achieve_pause());
        engine.finish().unwrap();
    }

    #[test]
    fn test_drain_handle_stops_intake() {
        let mut engine = engine(u64::MAX);
        engine.run(2).unwrap();
        thread::sleep(Duration::from_millis(20));
        let handle = engine.drain_handle();
        thread::spawn(move || handle.drain()).join().unwrap();

        let status = engine.wait_until_paused(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(status, TopologyStatus::Paused);
        engine.finish().unwrap();
        let report = engine.metrics();
        assert_eq!(report.events_in_flight, 0);
        assert_eq!(report.arrow("busy").unwrap().successes, report.events_read);
    }

    #[test]
    fn test_run_after_finish_is_noop() {
        let mut engine = engine(3);
        engine.run_to_completion(1).unwrap();
        engine.run(2).unwrap();
        assert_eq!(engine.worker_count(), 0);
        assert_eq!(engine.status(), TopologyStatus::Finished);
    }
}
