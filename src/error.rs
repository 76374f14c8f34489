//! Error handling for the eventflow engine
//!
//! This module defines the engine error type and a Result alias used
//! throughout the crate. Plugin code (event sources and stages) reports
//! failures with `anyhow::Error`; the engine wraps those into
//! [`EngineError::StageFailure`] together with the arrow name and the phase
//! in which the failure happened.

use crate::types::ExecutionPhase;
use thiserror::Error;

/// Boxed plugin error carried inside [`EngineError::StageFailure`].
pub type PluginError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// A source or stage raised an unexpected condition. Never retried.
    #[error("Stage failure in arrow '{arrow}' during {phase}: {source}")]
    StageFailure {
        arrow: String,
        phase: ExecutionPhase,
        #[source]
        source: PluginError,
    },

    /// An operation was invoked from a state in which it is not legal
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Errors related to building or wiring a topology
    #[error("Topology error: {0}")]
    Topology(String),

    /// A stage consumes a product that nothing upstream produces
    #[error("Port mismatch: {0}")]
    PortMismatch(String),

    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker thread spawn/join failures
    #[error("Worker error: {0}")]
    Worker(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Wrap a plugin error raised by `arrow` during `phase`
    pub fn stage(arrow: impl Into<String>, phase: ExecutionPhase, err: anyhow::Error) -> Self {
        EngineError::StageFailure {
            arrow: arrow.into(),
            phase,
            source: err.into(),
        }
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Name of the arrow that failed, if this is (or wraps) a stage failure
    pub fn arrow(&self) -> Option<&str> {
        match self {
            EngineError::StageFailure { arrow, .. } => Some(arrow),
            EngineError::WithContext { source, .. } => source.arrow(),
            _ => None,
        }
    }

    /// Phase of the failure, if this is (or wraps) a stage failure
    pub fn phase(&self) -> Option<ExecutionPhase> {
        match self {
            EngineError::StageFailure { phase, .. } => Some(*phase),
            EngineError::WithContext { source, .. } => source.phase(),
            _ => None,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> EngineResult<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for EngineResult<T> {
    fn context(self, context: impl Into<String>) -> EngineResult<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ProtocolViolation("finish() while Running".to_string());
        assert_eq!(
            err.to_string(),
            "Protocol violation: finish() while Running"
        );
    }

    #[test]
    fn test_stage_failure_carries_arrow_and_phase() {
        let err = EngineError::stage("tracker", ExecutionPhase::Execute, anyhow::anyhow!("boom"));
        assert_eq!(err.arrow(), Some("tracker"));
        assert_eq!(err.phase(), Some(ExecutionPhase::Execute));
        let text = err.to_string();
        assert!(text.contains("tracker"));
        assert!(text.contains("execute"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn test_error_with_context() {
        let err = EngineError::stage("src", ExecutionPhase::Open, anyhow::anyhow!("no file"));
        let with_ctx = err.with_context("Failed to start run");
        assert!(with_ctx.to_string().contains("Failed to start run"));
        assert_eq!(with_ctx.arrow(), Some("src"));
        assert_eq!(with_ctx.phase(), Some(ExecutionPhase::Open));
    }

    #[test]
    fn test_result_ext_context() {
        let res: EngineResult<()> = Err(EngineError::Topology("cycle".to_string()));
        let err = res.context("build").unwrap_err();
        assert_eq!(err.to_string(), "build: Topology error: cycle");
    }
}
