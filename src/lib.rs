//! memtrace - lock-free memory-access trace recorder
//!
//! The recording backend for a binary-instrumentation memory tracer: every load and
//! store the instrumentation reports is appended to a shared, memory-mapped trace
//! file through a single atomic cursor bump. Named phases are marked in the same
//! log, selected routines can be silenced per thread, and a watchdog stamps
//! heartbeats to prove the log keeps advancing.

pub mod cli;
pub mod config;
pub mod encoder;
pub mod error;
pub mod legacy;
pub mod phase;
pub mod record;
pub mod recorder;
pub mod sink;
pub mod suppression;
pub mod symbols;
pub mod synth;
pub mod trace_buffer;
pub mod watchdog;

pub use error::{Result, TraceError};
pub use recorder::{Recorder, ShutdownReport};
pub use trace_buffer::TraceBuffer;
