//! Per-thread silencing of recording
//!
//! Routines such as a work-queue dequeue generate a burst of synchronization traffic
//! that drowns the accesses of interest. The instrumentation marks entry and exit of
//! those routines, and while a thread is inside one its accesses are not recorded.
//!
//! Silencing is advisory and racy by design: the flag is a relaxed atomic, so an access
//! racing with `enter_silent_region` on the *same* thread cannot happen (a thread runs
//! its own callbacks in program order) while accesses from other threads are unaffected.
//!
//! The table has a fixed capacity. Thread ids at or beyond it are handled by the
//! configured [`OverflowPolicy`]: fail open (record, never suppress) or reject (drop).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Default number of thread slots
pub const DEFAULT_MAX_THREADS: usize = 128;

/// Upper bound on `max_threads`
pub const MAX_THREADS_LIMIT: usize = 4096;

/// What to do with threads whose id does not fit in the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Record their accesses; they can never be silenced
    #[default]
    FailOpen,
    /// Drop their accesses and count them
    Reject,
}

/// Stable small-integer handle for a thread inside the table's capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadSlot(usize);

impl ThreadSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Decision for one access attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Record,
    Suppressed,
    Rejected,
}

/// Fixed-capacity thread id → suppressed flag table
pub struct SuppressionTable {
    flags: Box<[AtomicBool]>,
    policy: OverflowPolicy,
    /// Entries into silent regions, keyed by caller-supplied identity (e.g. queue address)
    counts: Mutex<BTreeMap<u64, u64>>,
    out_of_range: AtomicU64,
    overflow_logged: AtomicBool,
}

impl SuppressionTable {
    /// Create a table for thread ids `0..max_threads` (clamped to `1..=MAX_THREADS_LIMIT`)
    pub fn new(max_threads: usize, policy: OverflowPolicy) -> Self {
        let capacity = max_threads.clamp(1, MAX_THREADS_LIMIT);
        SuppressionTable {
            flags: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            policy,
            counts: Mutex::new(BTreeMap::new()),
            out_of_range: AtomicU64::new(0),
            overflow_logged: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.flags.len()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Bounds-checked slot for `thread_id`
    pub fn slot(&self, thread_id: u32) -> Option<ThreadSlot> {
        let index = thread_id as usize;
        (index < self.flags.len()).then_some(ThreadSlot(index))
    }

    /// Mark `thread_id` as silenced and count one entry for `key`
    pub fn enter_silent_region(&self, key: u64, thread_id: u32) {
        if let Some(slot) = self.slot(thread_id) {
            self.flags[slot.0].store(true, Ordering::Relaxed);
        } else {
            self.note_out_of_range(thread_id);
        }
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(key).or_insert(0) += 1;
    }

    /// Clear the silenced flag of `thread_id`
    pub fn exit_silent_region(&self, thread_id: u32) {
        if let Some(slot) = self.slot(thread_id) {
            self.flags[slot.0].store(false, Ordering::Relaxed);
        }
    }

    /// True if `thread_id` is inside a silent region; out-of-range ids never are
    pub fn is_suppressed(&self, thread_id: u32) -> bool {
        self.slot(thread_id)
            .is_some_and(|slot| self.flags[slot.0].load(Ordering::Relaxed))
    }

    /// Decide whether an access from `thread_id` should be recorded
    pub fn admit(&self, thread_id: u32) -> Admission {
        match self.slot(thread_id) {
            Some(slot) if self.flags[slot.0].load(Ordering::Relaxed) => Admission::Suppressed,
            Some(_) => Admission::Record,
            None => {
                self.note_out_of_range(thread_id);
                match self.policy {
                    OverflowPolicy::FailOpen => Admission::Record,
                    OverflowPolicy::Reject => Admission::Rejected,
                }
            }
        }
    }

    fn note_out_of_range(&self, thread_id: u32) {
        self.out_of_range.fetch_add(1, Ordering::Relaxed);
        if !self.overflow_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                thread_id,
                capacity = self.flags.len(),
                policy = ?self.policy,
                "thread id beyond suppression table capacity"
            );
        }
    }

    /// Number of callbacks seen from thread ids beyond the capacity
    pub fn out_of_range_events(&self) -> u64 {
        self.out_of_range.load(Ordering::Relaxed)
    }

    /// Snapshot of the per-key entry counts, ordered by key
    pub fn counts(&self) -> BTreeMap<u64, u64> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Forget any silenced state left behind by an exiting thread
    pub fn reset_thread(&self, thread_id: u32) {
        self.exit_silent_region(thread_id);
    }
}

impl Default for SuppressionTable {
    fn default() -> Self {
        SuppressionTable::new(DEFAULT_MAX_THREADS, OverflowPolicy::default())
    }
}
