//! Error taxonomy for the trace recorder
//!
//! Setup errors (file creation, extension, mapping) are fatal and surface to the
//! operator. Steady-state errors (`CapacityExceeded`, `Closed`) are returned by the
//! low-level buffer API only; the recorder absorbs them into its statistics so the
//! instrumented program never sees them.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the trace recording backend
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid buffer capacity {capacity}: must be at least {minimum} bytes")]
    InvalidCapacity { capacity: u64, minimum: u64 },

    #[error("Trace capacity exceeded: {requested} bytes at offset {offset} (capacity {capacity})")]
    CapacityExceeded {
        requested: u64,
        offset: u64,
        capacity: u64,
    },

    #[error("Trace buffer is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Symbol lookup failed: {0}")]
    Symbols(String),

    #[error("Watchdog error: {0}")]
    Watchdog(String),

    #[error("Malformed trace at offset {offset}: {reason}")]
    Decode { offset: u64, reason: String },
}

impl TraceError {
    /// Wrap an I/O error with the operation and path it came from
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TraceError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// True for errors raised while recording rather than during setup
    pub fn is_steady_state(&self) -> bool {
        matches!(
            self,
            TraceError::CapacityExceeded { .. } | TraceError::Closed
        )
    }
}

/// Result type for trace recording operations
pub type Result<T> = std::result::Result<T, TraceError>;
