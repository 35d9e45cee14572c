//! Server configuration (`jackald.toml`).
//!
//! Only `[shared]` is required; every other table falls back to the
//! workspace defaults in [`jackal_common::consts`].

use jackal_common::config::{ConfigError, ConfigLoader, SharedConfig};
use jackal_common::consts::{
    DEFAULT_MAX_CLIENTS, DEFAULT_MAX_PORTS, DEFAULT_PERIOD_FRAMES, DEFAULT_RT_PRIORITY,
    DEFAULT_SAMPLE_RATE,
};
use jackal_shared_memory::ShmConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Fields common to all jackal services
    pub shared: SharedConfig,
    /// Process cycle parameters
    #[serde(default)]
    pub engine: EngineSection,
    /// Shared memory placement
    #[serde(default)]
    pub shm: ShmConfig,
    /// Diagnostic channel output
    #[serde(default)]
    pub diagnostics: DiagnosticsSection,
}

/// `[engine]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    /// Frames per second
    pub sample_rate: u32,
    /// Frames per cycle; a power of two
    pub period_frames: u32,
    /// Ask for SCHED_FIFO on the process thread
    pub realtime: bool,
    /// SCHED_FIFO priority when `realtime` is set
    pub rt_priority: i32,
    /// Upper bound on registered clients
    pub max_clients: usize,
    /// Upper bound on registered ports of each type
    pub max_ports: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            period_frames: DEFAULT_PERIOD_FRAMES,
            realtime: true,
            rt_priority: DEFAULT_RT_PRIORITY,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_ports: DEFAULT_MAX_PORTS,
        }
    }
}

impl EngineSection {
    /// Cycle length in microseconds.
    pub fn period_usecs(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.period_frames as u64 * 1_000_000 / self.sample_rate as u64
    }
}

/// `[diagnostics]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsSection {
    /// Prepended to every forwarded diagnostic message
    pub prefix: String,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            prefix: "jackald: ".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let engine = &self.engine;
        if engine.sample_rate == 0 {
            return Err(ConfigError::ValidationError(
                "engine.sample_rate must be > 0".to_string(),
            ));
        }
        if !engine.period_frames.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "engine.period_frames must be a non-zero power of two, got {}",
                engine.period_frames
            )));
        }
        if !(1..=99).contains(&engine.rt_priority) {
            return Err(ConfigError::ValidationError(format!(
                "engine.rt_priority must be in 1..=99, got {}",
                engine.rt_priority
            )));
        }
        if engine.max_clients == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_clients must be > 0".to_string(),
            ));
        }
        if engine.max_ports == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_ports must be > 0".to_string(),
            ));
        }
        if self.shm.prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "shm.prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
