//! Configuration module for eventflow
//!
//! The engine consumes configuration values but never owns a global
//! parameter store: an [`EngineConfig`] is built once (defaults, TOML file or
//! string) and handed explicitly to the pool, the topology builder and the
//! engine controller.
//!
//! # Example
//!
//! ```ignore
//! use eventflow::config::EngineConfig;
//!
//! let config = EngineConfig::load("eventflow.toml")?;
//! config.validate()?;
//! println!("{} worker threads", config.workers.nthreads);
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default application identity stamped onto every fetched event
pub const DEFAULT_APPLICATION_NAME: &str = "eventflow";

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Owning-application identity tagged onto events by source arrows
    pub application_name: String,

    /// Worker pool settings
    pub workers: WorkerSettings,

    /// Event pool settings
    pub pool: PoolSettings,

    /// Source arrow settings
    pub source: SourceSettings,

    /// Topology construction settings
    pub topology: TopologySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            workers: WorkerSettings::default(),
            pool: PoolSettings::default(),
            source: SourceSettings::default(),
            topology: TopologySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize this configuration to TOML text
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Load a configuration file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save this configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| EngineError::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.workers.nthreads == 0 {
            return Err(EngineError::Config("workers.nthreads must be at least 1".into()));
        }
        if self.workers.idle_backoff_min_us > self.workers.idle_backoff_max_us {
            return Err(EngineError::Config(
                "workers.idle_backoff_min_us exceeds workers.idle_backoff_max_us".into(),
            ));
        }
        if self.pool.location_count == 0 {
            return Err(EngineError::Config("pool.location_count must be at least 1".into()));
        }
        if self.pool.limit_total_events_in_flight && self.pool.pool_size == 0 {
            return Err(EngineError::Config(
                "pool.pool_size must be at least 1 when in-flight events are limited".into(),
            ));
        }
        if self.source.max_batch == 0 {
            return Err(EngineError::Config("source.max_batch must be at least 1".into()));
        }
        if self.source.min_batch > self.source.max_batch {
            return Err(EngineError::Config(format!(
                "source.min_batch ({}) exceeds source.max_batch ({})",
                self.source.min_batch, self.source.max_batch
            )));
        }
        if self.topology.queue_capacity == 0 {
            return Err(EngineError::Config("topology.queue_capacity must be at least 1".into()));
        }
        if self.topology.default_parallelism == 0 {
            return Err(EngineError::Config(
                "topology.default_parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
