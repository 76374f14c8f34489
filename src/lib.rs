//! # eventflow: multi-threaded dataflow engine
//!
//! A pull-based event-processing engine: a graph of processing stages
//! ("arrows") connected by bounded queues, driven by a fixed pool of worker
//! threads that request assignments from a central scheduler.
//!
//! ## Architecture
//!
//! - **Pool**: sharded, capacity-bounded arena of reusable events
//! - **Engine**: arrows, queues, topology lifecycle, scheduler and workers
//! - **Config**: TOML-backed settings handed explicitly to each component
//! - **Synthetic**: load-generating source and stage for demos and benches
//!
//! ## Example
//!
//! ```ignore
//! use eventflow::{
//!     config::EngineConfig,
//!     engine::{Engine, TopologyBuilder},
//!     pool::EventPool,
//!     synthetic::{BusyStage, SyntheticSource},
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! let config = EngineConfig::load_or_default("eventflow.toml");
//! let pool = Arc::new(EventPool::new(&config.pool)?);
//! let mut builder = TopologyBuilder::new(&config, pool);
//! let events = builder.add_queue("events");
//! builder.add_source("generator", Box::new(SyntheticSource::new(1000)), events)?;
//! builder.add_sink("busy", events, vec![Box::new(BusyStage::new(Duration::from_micros(100)))])?;
//!
//! let mut engine = Engine::new(builder.build()?, config);
//! let report = engine.run_to_completion(4)?;
//! println!("{:.1} events/s", report.throughput_hz());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod synthetic;
pub mod types;

pub use error::{EngineError, EngineResult, ResultExt};
pub use types::{ArrowStatus, ExecutionPhase, StreamStatus, TopologyStatus};
