//! Test data builders for source-to-sink pipelines

use super::mock_helpers::{CountingSource, FetchTracker, RecordingStage, StageLog};
use eventflow::config::{EngineConfig, PoolSettings};
use eventflow::engine::{ArrowId, Engine, Topology, TopologyBuilder};
use eventflow::pool::EventPool;
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration with short idle backoff, so tests react quickly
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers.idle_backoff_min_us = 10;
    config.workers.idle_backoff_max_us = 500;
    config
}

/// A built `source -> queue -> sink` topology plus its observers
pub struct Pipeline {
    pub topology: Topology,
    pub config: EngineConfig,
    pub log: Arc<StageLog>,
    pub tracker: Arc<FetchTracker>,
    pub source: ArrowId,
    pub sink: ArrowId,
}

impl Pipeline {
    pub fn into_engine(self) -> (Engine, Arc<StageLog>, Arc<FetchTracker>) {
        (Engine::new(self.topology, self.config), self.log, self.tracker)
    }
}

/// Builder for a counting source feeding a recording sink
pub struct PipelineBuilder {
    config: EngineConfig,
    events: u64,
    queue_capacity: Option<usize>,
    source_parallelism: usize,
    sink_parallelism: usize,
    batch_bounds: Option<(usize, usize)>,
    fetch_delay: Duration,
    stage_delay: Duration,
    fail_at: Option<u64>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            events: 10,
            queue_capacity: None,
            source_parallelism: 1,
            sink_parallelism: 1,
            batch_bounds: None,
            fetch_delay: Duration::ZERO,
            stage_delay: Duration::ZERO,
            fail_at: None,
        }
    }

    pub fn events(mut self, events: u64) -> Self {
        self.events = events;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn pool(mut self, pool_size: usize, location_count: usize) -> Self {
        self.config.pool = PoolSettings {
            pool_size,
            location_count,
            limit_total_events_in_flight: true,
        };
        self
    }

    pub fn source_parallelism(mut self, parallelism: usize) -> Self {
        self.source_parallelism = parallelism;
        self
    }

    pub fn sink_parallelism(mut self, parallelism: usize) -> Self {
        self.sink_parallelism = parallelism;
        self
    }

    pub fn batch_bounds(mut self, min: usize, max: usize) -> Self {
        self.batch_bounds = Some((min, max));
        self
    }

    pub fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = delay;
        self
    }

    pub fn fail_at(mut self, event_number: u64) -> Self {
        self.fail_at = Some(event_number);
        self
    }

    pub fn build(self) -> Pipeline {
        let log = StageLog::new();
        let tracker = FetchTracker::new();
        let pool = Arc::new(EventPool::new(&self.config.pool).expect("pool settings are valid"));
        let mut builder = TopologyBuilder::new(&self.config, pool);

        let queue = match self.queue_capacity {
            Some(capacity) => builder
                .add_queue_with_capacity("events", capacity)
                .expect("capacity is non-zero"),
            None => builder.add_queue("events"),
        };

        let counting = CountingSource::tracked(self.events, Arc::clone(&tracker))
            .with_fetch_delay(self.fetch_delay);
        let source = builder
            .add_source("source", Box::new(counting), queue)
            .expect("source added");

        let mut stage = RecordingStage::new("recorder", Arc::clone(&log)).with_delay(self.stage_delay);
        if let Some(n) = self.fail_at {
            stage = stage.failing_at(n);
        }
        let sink = builder
            .add_sink("sink", queue, vec![Box::new(stage)])
            .expect("sink added");

        builder
            .set_parallelism(source, self.source_parallelism)
            .expect("source parallelism");
        builder
            .set_parallelism(sink, self.sink_parallelism)
            .expect("sink parallelism");
        if let Some((min, max)) = self.batch_bounds {
            builder.set_batch_bounds(source, min, max).expect("batch bounds");
        }

        Pipeline {
            topology: builder.build().expect("pipeline topology is valid"),
            config: self.config,
            log,
            tracker,
            source,
            sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow::TopologyStatus;

    #[test]
    fn test_pipeline_builder_defaults() {
        let pipeline = PipelineBuilder::new().build();
        assert_eq!(pipeline.topology.status(), TopologyStatus::Paused);
        assert_eq!(pipeline.topology.arrows().len(), 2);
        assert!(pipeline.topology.is_source(pipeline.source));
        assert!(!pipeline.topology.is_source(pipeline.sink));
    }

    #[test]
    fn test_pipeline_builder_custom_queue() {
        let pipeline = PipelineBuilder::new().queue_capacity(2).build();
        assert_eq!(pipeline.topology.queues()[0].capacity(), 2);
    }
}
