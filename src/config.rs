//! Recorder configuration
//!
//! Every input the recording core consumes, independent of CLI syntax. Loadable from
//! a TOML file:
//!
//! ```toml
//! output = "trace.bin"
//! capacity_bytes = 67108864
//! address_mode = "page"
//! silence_routines = ["tq_dequeue"]
//!
//! [[phases]]
//! name = "map"
//! routine = "map_worker"
//!
//! [watchdog]
//! mode = "process"
//! heartbeats = 50
//! interval_ms = 10
//! ```

use crate::encoder::{AddressMode, EncoderOptions};
use crate::error::{Result, TraceError};
use crate::phase::{default_phases, PhaseSpec};
use crate::suppression::{OverflowPolicy, DEFAULT_MAX_THREADS, MAX_THREADS_LIMIT};
use crate::trace_buffer::MIN_CAPACITY;
use crate::watchdog::WatchdogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default trace capacity: 64 MiB
pub const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// Storage backend for the trace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Lock-free binary append log in a shared file mapping
    #[default]
    Mapped,
    /// Mutex-serialized human-readable lines
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub output: PathBuf,
    /// Pre-sized capacity of the mapped trace; there is no growth
    pub capacity_bytes: u64,
    pub backend: Backend,
    pub address_mode: AddressMode,
    pub include_prefetch: bool,
    pub max_threads: usize,
    pub overflow_policy: OverflowPolicy,
    /// Ordered phase name / routine pairs
    pub phases: Vec<PhaseSpec>,
    /// Routines whose memory traffic is never recorded
    pub silence_routines: Vec<String>,
    pub watchdog: WatchdogConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            output: PathBuf::from("memtrace.bin"),
            capacity_bytes: DEFAULT_CAPACITY,
            backend: Backend::Mapped,
            address_mode: AddressMode::Raw,
            include_prefetch: true,
            max_threads: DEFAULT_MAX_THREADS,
            overflow_policy: OverflowPolicy::FailOpen,
            phases: default_phases(),
            silence_routines: vec!["tq_dequeue".to_string()],
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Defaults with a different output path
    pub fn with_output(output: impl Into<PathBuf>) -> Self {
        RecorderConfig {
            output: output.into(),
            ..RecorderConfig::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| TraceError::io("Failed to read config", path, e))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RecorderConfig = toml::from_str(content)
            .map_err(|e| TraceError::Config(format!("Failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Mapped && self.capacity_bytes < MIN_CAPACITY {
            return Err(TraceError::InvalidCapacity {
                capacity: self.capacity_bytes,
                minimum: MIN_CAPACITY,
            });
        }
        if self.max_threads == 0 || self.max_threads > MAX_THREADS_LIMIT {
            return Err(TraceError::Config(format!(
                "max_threads must be in 1..={MAX_THREADS_LIMIT}, got {}",
                self.max_threads
            )));
        }
        if self.watchdog.enabled && self.watchdog.interval_ms == 0 {
            return Err(TraceError::Config(
                "watchdog.interval_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(routine) = self.silence_routines.iter().find(|r| r.is_empty()) {
            return Err(TraceError::Config(format!(
                "empty silence routine name {routine:?}"
            )));
        }
        // phase names are checked by PhaseTable::new
        crate::phase::PhaseTable::new(self.phases.clone()).map(|_| ())
    }

    pub fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            address_mode: self.address_mode,
            include_prefetch: self.include_prefetch,
        }
    }
}
