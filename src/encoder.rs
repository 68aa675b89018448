//! Event encoder: the hot path between instrumentation callbacks and the sink
//!
//! For every qualifying access the encoder consults the [`SuppressionTable`],
//! canonicalizes the address, and hands a fixed-size record to the sink. Nothing here
//! locks or blocks; concurrent calls interleave freely because each record lands in
//! its own reserved range.
//!
//! # Two-step writes
//!
//! A store's effective address is known before the instruction executes, but whether
//! it retired (and through which exit) is only known afterwards. The instrumentation
//! therefore calls [`EventEncoder::record_write_effective_address`] before the store
//! and [`EventEncoder::confirm_write`] after it.
//!
//! The candidate address is parked in a slot *per thread*, so threads can never see
//! each other's pending address. The remaining precondition is per thread: at most one
//! store is in flight between capture and confirm, with no reentrant capture in
//! between. Single-destination stores observed by one thread satisfy this. Threads
//! whose id is beyond the table capacity share one overflow slot and are racy.

use crate::error::TraceError;
use crate::record::{trace_thread_id, AccessKind};
use crate::sink::TraceSink;
use crate::suppression::{Admission, SuppressionTable};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Mask that floors an address to its 4 KiB page
pub const PAGE_MASK: u64 = !0xfff;

/// How addresses are canonicalized before recording
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// Record the effective address unchanged
    #[default]
    Raw,
    /// Record the start of the containing 4 KiB page
    Page,
}

impl AddressMode {
    pub fn canonicalize(self, address: u64) -> u64 {
        match self {
            AddressMode::Raw => address,
            AddressMode::Page => address & PAGE_MASK,
        }
    }
}

/// Encoder knobs taken from the recorder configuration
#[derive(Debug, Clone, Copy)]
pub struct EncoderOptions {
    pub address_mode: AddressMode,
    pub include_prefetch: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            address_mode: AddressMode::Raw,
            include_prefetch: true,
        }
    }
}

/// Counters updated on the hot path
#[derive(Default)]
struct EncoderStats {
    recorded: CachePadded<AtomicU64>,
    suppressed: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
    prefetch_skipped: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    unmatched_confirms: CachePadded<AtomicU64>,
    phases: CachePadded<AtomicU64>,
}

/// Point-in-time copy of the encoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSnapshot {
    /// Access records written
    pub recorded: u64,
    /// Accesses skipped because their thread was silenced
    pub suppressed: u64,
    /// Accesses dropped by the `reject` overflow policy
    pub rejected: u64,
    /// Prefetches skipped because prefetch recording is off
    pub prefetch_skipped: u64,
    /// Records lost to a full or closed buffer
    pub dropped: u64,
    /// Write confirmations with no captured address
    pub unmatched_confirms: u64,
    /// Phase markers written
    pub phases: u64,
}

impl EncoderSnapshot {
    /// True if any record was lost to the buffer rather than filtered on purpose
    pub fn is_degraded(&self) -> bool {
        self.dropped > 0
    }
}

struct PendingSlot {
    address: AtomicU64,
    armed: AtomicBool,
}

impl PendingSlot {
    fn new() -> Self {
        PendingSlot {
            address: AtomicU64::new(0),
            armed: AtomicBool::new(false),
        }
    }
}

/// Serializes access and phase events into a [`TraceSink`]
pub struct EventEncoder {
    sink: Arc<dyn TraceSink>,
    suppression: Arc<SuppressionTable>,
    options: EncoderOptions,
    pending: Box<[PendingSlot]>,
    overflow_pending: PendingSlot,
    stats: EncoderStats,
    drop_logged: AtomicBool,
}

impl EventEncoder {
    pub fn new(
        sink: Arc<dyn TraceSink>,
        suppression: Arc<SuppressionTable>,
        options: EncoderOptions,
    ) -> Self {
        let pending = (0..suppression.capacity())
            .map(|_| PendingSlot::new())
            .collect();
        EventEncoder {
            sink,
            suppression,
            options,
            pending,
            overflow_pending: PendingSlot::new(),
            stats: EncoderStats::default(),
            drop_logged: AtomicBool::new(false),
        }
    }

    pub fn sink(&self) -> &Arc<dyn TraceSink> {
        &self.sink
    }

    pub fn suppression(&self) -> &Arc<SuppressionTable> {
        &self.suppression
    }

    pub fn options(&self) -> EncoderOptions {
        self.options
    }

    /// Record one load or store unless the thread is silenced or filtered
    pub fn record_access(
        &self,
        thread_id: u32,
        ip: u64,
        kind: AccessKind,
        address: u64,
        is_prefetch: bool,
    ) {
        match self.suppression.admit(thread_id) {
            Admission::Record => {}
            Admission::Suppressed => {
                self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Admission::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if is_prefetch && !self.options.include_prefetch {
            self.stats.prefetch_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let address = self.options.address_mode.canonicalize(address);
        match self
            .sink
            .write_access(trace_thread_id(thread_id), ip, kind, address)
        {
            Ok(()) => {
                self.stats.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.note_dropped(&err),
        }
    }

    fn pending_slot(&self, thread_id: u32) -> &PendingSlot {
        self.suppression
            .slot(thread_id)
            .map_or(&self.overflow_pending, |slot| &self.pending[slot.index()])
    }

    /// Park the effective address of a store that is about to execute
    pub fn record_write_effective_address(&self, thread_id: u32, address: u64) {
        let slot = self.pending_slot(thread_id);
        slot.address.store(address, Ordering::Relaxed);
        slot.armed.store(true, Ordering::Release);
    }

    /// Emit the write parked by `record_write_effective_address`
    ///
    /// Called on fall-through or on the taken branch, whichever the store left by.
    /// A confirm with nothing parked (the store's predicate was false) is counted
    /// and ignored.
    pub fn confirm_write(&self, thread_id: u32, ip: u64) {
        let slot = self.pending_slot(thread_id);
        if !slot.armed.swap(false, Ordering::Acquire) {
            self.stats.unmatched_confirms.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let address = slot.address.load(Ordering::Relaxed);
        self.record_access(thread_id, ip, AccessKind::Write, address, false);
    }

    /// Drop any store left parked by an exiting thread
    pub fn reset_thread(&self, thread_id: u32) {
        self.pending_slot(thread_id)
            .armed
            .store(false, Ordering::Relaxed);
    }

    /// Write the marker for entering phase `name`
    pub fn record_phase(&self, name: &str) {
        match self.sink.write_phase(name) {
            Ok(()) => {
                self.stats.phases.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.note_dropped(&err),
        }
    }

    fn note_dropped(&self, err: &TraceError) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        if !self.drop_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(error = %err, "trace record dropped; the trace is degraded");
        }
    }

    pub fn snapshot(&self) -> EncoderSnapshot {
        let load = |c: &CachePadded<AtomicU64>| c.load(Ordering::Relaxed);
        EncoderSnapshot {
            recorded: load(&self.stats.recorded),
            suppressed: load(&self.stats.suppressed),
            rejected: load(&self.stats.rejected),
            prefetch_skipped: load(&self.stats.prefetch_skipped),
            dropped: load(&self.stats.dropped),
            unmatched_confirms: load(&self.stats.unmatched_confirms),
            phases: load(&self.stats.phases),
        }
    }
}
