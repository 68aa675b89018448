//! Recording session: the surface the instrumentation layer calls into
//!
//! ```text
//! instrumentation ──► Recorder::on_memory_read / on_memory_write_* ──► EventEncoder ──► TraceSink
//!                 ──► Recorder::on_routine_entry/exit ──► PhaseTracker / SuppressionTable
//! Watchdog (thread or child process) ──► TraceBuffer heartbeats
//! ```
//!
//! `Recorder::start` performs all fallible setup. Every callback afterwards returns
//! `()`: failures while recording are counted and surface only in the
//! [`ShutdownReport`] returned by [`Recorder::finish`].

use crate::config::{Backend, RecorderConfig};
use crate::encoder::{EncoderSnapshot, EventEncoder};
use crate::error::Result;
use crate::legacy::TextTrace;
use crate::phase::{PhaseTable, PhaseTracker, ResolvedPhase};
use crate::record::AccessKind;
use crate::sink::TraceSink;
use crate::suppression::SuppressionTable;
use crate::symbols::SymbolLookup;
use crate::trace_buffer::TraceBuffer;
use crate::watchdog::{TerminationReport, Watchdog};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Routines bound in one loaded image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBindings {
    pub phases: Vec<ResolvedPhase>,
    /// (routine name, entry address)
    pub silence: Vec<(String, u64)>,
}

/// A live recording session
pub struct Recorder {
    config: RecorderConfig,
    buffer: Option<Arc<TraceBuffer>>,
    encoder: EventEncoder,
    phases: PhaseTracker,
    silence_routines: RwLock<HashMap<u64, String>>,
    watchdog: Option<Watchdog>,
}

impl Recorder {
    /// Open the output, build the tables, and start the watchdog
    pub fn start(config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        let table = PhaseTable::new(config.phases.clone())?;

        let (sink, buffer): (Arc<dyn TraceSink>, Option<Arc<TraceBuffer>>) = match config.backend
        {
            Backend::Mapped => {
                let buffer = Arc::new(TraceBuffer::open(&config.output, config.capacity_bytes)?);
                (buffer.clone(), Some(buffer))
            }
            Backend::Text => (Arc::new(TextTrace::create(&config.output)?), None),
        };

        let suppression = Arc::new(SuppressionTable::new(
            config.max_threads,
            config.overflow_policy,
        ));
        let encoder = EventEncoder::new(sink, suppression, config.encoder_options());

        let watchdog = match &buffer {
            Some(buffer) if config.watchdog.enabled => {
                Some(Watchdog::spawn(buffer.clone(), &config.watchdog)?)
            }
            None if config.watchdog.enabled => {
                tracing::info!("watchdog needs the mapped backend; disabled for text traces");
                None
            }
            _ => None,
        };

        tracing::info!(
            output = %config.output.display(),
            backend = ?config.backend,
            capacity = config.capacity_bytes,
            "recording started"
        );

        Ok(Recorder {
            config,
            buffer,
            encoder,
            phases: PhaseTracker::new(table),
            silence_routines: RwLock::new(HashMap::new()),
            watchdog,
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn encoder(&self) -> &EventEncoder {
        &self.encoder
    }

    pub fn suppression(&self) -> &SuppressionTable {
        self.encoder.suppression()
    }

    pub fn phases(&self) -> &PhaseTracker {
        &self.phases
    }

    /// Mapped buffer, when the binary backend is in use
    pub fn buffer(&self) -> Option<&Arc<TraceBuffer>> {
        self.buffer.as_ref()
    }

    /// Resolve phase and silence routines in a newly loaded image
    pub fn on_image_load(&self, image: &dyn SymbolLookup) -> ImageBindings {
        let phases = self.phases.resolve_image(image);

        let silence: Vec<(String, u64)> = self
            .config
            .silence_routines
            .iter()
            .filter_map(|name| image.find_routine(name).map(|addr| (name.clone(), addr)))
            .collect();
        if !silence.is_empty() {
            let mut routines = self
                .silence_routines
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (name, addr) in &silence {
                routines.insert(*addr, name.clone());
            }
        }

        ImageBindings { phases, silence }
    }

    pub fn on_thread_start(&self, thread_id: u32) {
        tracing::debug!(thread_id, "thread begin");
    }

    pub fn on_thread_fini(&self, thread_id: u32) {
        self.encoder.suppression().reset_thread(thread_id);
        self.encoder.reset_thread(thread_id);
        tracing::debug!(thread_id, "thread end");
    }

    /// Load from `address` executed at `ip`
    pub fn on_memory_read(&self, thread_id: u32, ip: u64, address: u64, is_prefetch: bool) {
        self.encoder
            .record_access(thread_id, ip, AccessKind::Read, address, is_prefetch);
    }

    /// Store to `address` is about to execute
    pub fn on_memory_write_before(&self, thread_id: u32, address: u64) {
        self.encoder.record_write_effective_address(thread_id, address);
    }

    /// The store captured by `on_memory_write_before` retired at `ip`
    pub fn on_memory_write_after(&self, thread_id: u32, ip: u64) {
        self.encoder.confirm_write(thread_id, ip);
    }

    /// Routine entry; `first_arg` identifies the object a silenced routine works on
    pub fn on_routine_entry(&self, thread_id: u32, routine_address: u64, first_arg: u64) {
        self.phases.on_routine_entry(routine_address, &self.encoder);
        if self.is_silence_routine(routine_address) {
            self.encoder
                .suppression()
                .enter_silent_region(first_arg, thread_id);
        }
    }

    pub fn on_routine_exit(&self, thread_id: u32, routine_address: u64) {
        if self.is_silence_routine(routine_address) {
            self.encoder.suppression().exit_silent_region(thread_id);
        }
    }

    fn is_silence_routine(&self, routine_address: u64) -> bool {
        self.silence_routines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&routine_address)
    }

    /// Emit the marker for phase `phase_index` directly
    pub fn enter_phase(&self, phase_index: usize) -> bool {
        self.phases.enter_phase(phase_index, &self.encoder)
    }

    /// Stop the watchdog, write the terminal marker, and finalize the trace
    pub fn finish(mut self) -> Result<ShutdownReport> {
        let watchdog = self.watchdog.take().map(|w| {
            let report = w.terminate();
            if report.is_success() {
                tracing::info!(%report, "watchdog stopped");
            } else {
                tracing::warn!(%report, "watchdog termination failed");
            }
            report
        });

        let sink = self.encoder.sink();
        let eof_written = match sink.write_eof() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "no room for the terminal marker");
                false
            }
        };
        let logical_length = sink.finish()?;

        let report = ShutdownReport {
            output: self.config.output.clone(),
            backend: sink.kind(),
            logical_length,
            capacity: self.buffer.as_ref().map(|b| b.capacity()),
            truncated: self.buffer.as_ref().is_some_and(|b| b.is_truncated()) || !eof_written,
            eof_written,
            encoder: self.encoder.snapshot(),
            silence_counts: self.encoder.suppression().counts(),
            out_of_range_thread_events: self.encoder.suppression().out_of_range_events(),
            watchdog,
        };
        tracing::info!(logical_length, "recording finished");
        Ok(report)
    }
}

/// Summary printed to the status stream at shutdown
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub output: PathBuf,
    pub backend: &'static str,
    /// Meaningful bytes in the output (header included for the mapped backend)
    pub logical_length: u64,
    pub capacity: Option<u64>,
    /// Records were lost to a full buffer
    pub truncated: bool,
    pub eof_written: bool,
    pub encoder: EncoderSnapshot,
    /// Silent-region entries per key (e.g. queue address)
    pub silence_counts: BTreeMap<u64, u64>,
    pub out_of_range_thread_events: u64,
    pub watchdog: Option<TerminationReport>,
}

impl ShutdownReport {
    pub fn is_degraded(&self) -> bool {
        self.truncated || self.encoder.is_degraded()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trace {} ({}): logical length {} bytes",
            self.output.display(),
            self.backend,
            self.logical_length
        )?;
        if let Some(capacity) = self.capacity {
            write!(f, " of {capacity}")?;
        }
        writeln!(f)?;
        let e = &self.encoder;
        writeln!(
            f,
            "accesses: {} recorded, {} suppressed, {} rejected, {} prefetch skipped, {} dropped; phases: {}",
            e.recorded, e.suppressed, e.rejected, e.prefetch_skipped, e.dropped, e.phases
        )?;
        if self.is_degraded() {
            writeln!(f, "WARNING: trace is truncated (buffer capacity exceeded)")?;
        }
        if self.out_of_range_thread_events > 0 {
            writeln!(
                f,
                "WARNING: {} callbacks from threads beyond the suppression table",
                self.out_of_range_thread_events
            )?;
        }
        for (key, count) in &self.silence_counts {
            writeln!(f, "{key:#x} , {count}")?;
        }
        match &self.watchdog {
            Some(report) => writeln!(f, "{report}"),
            None => writeln!(f, "watchdog disabled"),
        }
    }
}
