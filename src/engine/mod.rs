//! Multi-threaded dataflow engine.
//!
//! Arrows (processing stages) are connected by bounded queues and driven by
//! a pool of worker threads that request assignments from a central
//! scheduler.
//!
//! # Architecture
//!
//! ```text
//! [SourceArrow] ──► Queue ──► [StageArrow] ──► Queue ──► [StageArrow (sink)]
//!       ▲                          ▲                             ▲
//!       └────────── Worker ◄── Scheduler ──► Worker ─────────────┘
//! ```
//!
//! # Design
//!
//! - **One scheduling mutex** - assignment decisions are serialized; stage
//!   work runs outside the lock.
//! - **Handles, not owners** - queues carry `EventHandle`s into the
//!   `EventPool` arena, which is the only allocator of events.
//! - **Non-blocking fetch gate** - one fetcher per source; losers move on.
//! - **Explicit lifecycle** - Running, Pausing, Paused, Draining, Finished,
//!   owned by the `Topology`.

pub mod arrow;
pub mod controller;
pub mod id;
pub mod metrics;
pub mod port;
pub mod queue;
pub mod scheduler;
pub mod source;
pub mod stage;
pub mod topology;
pub mod worker;

pub use arrow::{Arrow, ArrowCore, ExecutionContext};
pub use controller::{DrainHandle, Engine};
pub use id::{ArrowId, QueueId, WorkerId};
pub use metrics::{ArrowMetrics, ArrowMetricsSnapshot, MetricsReport, StatusTransition, TopologyMetrics};
pub use port::{PortDescriptor, PortDirection};
pub use queue::Queue;
pub use scheduler::Scheduler;
pub use source::{EventSource, FetchGate, FetchGuard, FetchStatus, SourceArrow};
pub use stage::{Stage, StageArrow};
pub use topology::{Topology, TopologyBuilder};
pub use worker::{Worker, WorkerReport, WorkerStats};
