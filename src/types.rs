//! Core status types shared across the engine
//!
//! These small enums describe the outcome of one unit of work
//! ([`StreamStatus`]), the lifecycle of a single arrow ([`ArrowStatus`]), the
//! lifecycle of the whole graph ([`TopologyStatus`]) and the plugin phase in
//! which a failure happened ([`ExecutionPhase`]).
//!
//! Arrow and topology status are stored in atomics so that `pause()` and
//! `drain()` never take a lock; the `as_u8`/`from_u8` pairs below are the
//! encoding used for that.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a single `execute()` call on an arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// One unit of work was performed
    Success,
    /// Inputs unavailable or outputs full; try again later
    ComeBackLater,
    /// No more input is possible for this arrow
    Finished,
    /// The execution raised a stage failure
    Error,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::Success => "Success",
            StreamStatus::ComeBackLater => "ComeBackLater",
            StreamStatus::Finished => "Finished",
            StreamStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a single arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrowStatus {
    Unopened,
    Running,
    Paused,
    Finished,
}

impl ArrowStatus {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            ArrowStatus::Unopened => 0,
            ArrowStatus::Running => 1,
            ArrowStatus::Paused => 2,
            ArrowStatus::Finished => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => ArrowStatus::Unopened,
            1 => ArrowStatus::Running,
            2 => ArrowStatus::Paused,
            _ => ArrowStatus::Finished,
        }
    }
}

impl fmt::Display for ArrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArrowStatus::Unopened => "Unopened",
            ArrowStatus::Running => "Running",
            ArrowStatus::Paused => "Paused",
            ArrowStatus::Finished => "Finished",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of the whole topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyStatus {
    Running,
    Pausing,
    Paused,
    Draining,
    Finished,
}

impl TopologyStatus {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            TopologyStatus::Running => 0,
            TopologyStatus::Pausing => 1,
            TopologyStatus::Paused => 2,
            TopologyStatus::Draining => 3,
            TopologyStatus::Finished => 4,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => TopologyStatus::Running,
            1 => TopologyStatus::Pausing,
            2 => TopologyStatus::Paused,
            3 => TopologyStatus::Draining,
            _ => TopologyStatus::Finished,
        }
    }
}

impl fmt::Display for TopologyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyStatus::Running => "Running",
            TopologyStatus::Pausing => "Pausing",
            TopologyStatus::Paused => "Paused",
            TopologyStatus::Draining => "Draining",
            TopologyStatus::Finished => "Finished",
        };
        f.write_str(s)
    }
}

/// Plugin phase in which a stage failure was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// `EventSource::open`
    Open,
    /// `Stage::configure`
    Configure,
    /// `Stage::change_run`
    ChangeRun,
    /// `Stage::execute` or a custom arrow's `execute`
    Execute,
    /// `EventSource::fetch` under the fatal fetch policy
    Fetch,
    /// Arrow teardown during `finish()`
    Finalize,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionPhase::Open => "open",
            ExecutionPhase::Configure => "configure",
            ExecutionPhase::ChangeRun => "change_run",
            ExecutionPhase::Execute => "execute",
            ExecutionPhase::Fetch => "fetch",
            ExecutionPhase::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrow_status_encoding() {
        for status in [
            ArrowStatus::Unopened,
            ArrowStatus::Running,
            ArrowStatus::Paused,
            ArrowStatus::Finished,
        ] {
            assert_eq!(ArrowStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_topology_status_encoding() {
        for status in [
            TopologyStatus::Running,
            TopologyStatus::Pausing,
            TopologyStatus::Paused,
            TopologyStatus::Draining,
            TopologyStatus::Finished,
        ] {
            assert_eq!(TopologyStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&StreamStatus::ComeBackLater).unwrap();
        assert_eq!(json, "\"come_back_later\"");
        let status: TopologyStatus = serde_json::from_str("\"draining\"").unwrap();
        assert_eq!(status, TopologyStatus::Draining);
    }
}
