//! Shared append buffer over a memory-mapped trace file
//!
//! The hot path of every instrumented memory access ends here, so reservation is a
//! single atomic `fetch_add` on a cursor that lives *inside* the mapping. Placing the
//! cursor in the shared region (instead of process memory) lets a forked watchdog
//! advance the same logical counter as the traced process.
//!
//! # Design
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ WRITER THREADS (any number, any process sharing the mapping)   │
//! │   start = cursor.fetch_add(n)        // one atomic instruction │
//! │   copy record into [start, start+n)  // exclusive, no lock     │
//! └────────────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌───────────┬────────────────────────────────────────────────────┐
//! │ cursor    │ payload, append-only                               │
//! └───────────┴────────────────────────────────────────────────────┘
//!   header       MAP_SHARED file mapping, pre-extended to capacity
//! ```
//!
//! # Overrun policy
//!
//! The capacity is fixed at open. A reservation whose end would pass the capacity is
//! refused with [`TraceError::CapacityExceeded`] and nothing is written; the smallest
//! refused start offset becomes the truncation point, so the length recorded by
//! [`TraceBuffer::close`] never covers bytes no writer owns. The buffer stops
//! accepting records from that point on (every later reservation starts past it).

use crate::error::{Result, TraceError};
use crate::record::{EOF_MARKER, HEADER_LEN};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Smallest usable capacity: the header plus room for the terminal marker
pub const MIN_CAPACITY: u64 = HEADER_LEN + EOF_MARKER.len() as u64;

/// Fixed-capacity, lock-free append log in a shared file mapping
pub struct TraceBuffer {
    path: PathBuf,
    capacity: u64,
    /// Start of the mapping; owned by `mmap`
    base: NonNull<u8>,
    mmap: MmapMut,
    closed: AtomicBool,
    /// Smallest start offset of a refused reservation (`u64::MAX` if none)
    truncated_at: AtomicU64,
    final_len: Mutex<Option<u64>>,
}

// SAFETY: all shared mutation goes through the atomic cursor or through
// `Reservation`s, and reservations hand out pairwise disjoint byte ranges.
unsafe impl Send for TraceBuffer {}
unsafe impl Sync for TraceBuffer {}

impl TraceBuffer {
    /// Create (or truncate) `path`, extend it to `capacity` bytes and map it shared
    ///
    /// The file is extended by seeking to `capacity - 1` and writing one byte, which
    /// leaves the rest sparse on filesystems that support it.
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref();
        if capacity < MIN_CAPACITY {
            return Err(TraceError::InvalidCapacity {
                capacity,
                minimum: MIN_CAPACITY,
            });
        }
        let map_len = usize::try_from(capacity).map_err(|_| TraceError::InvalidCapacity {
            capacity,
            minimum: MIN_CAPACITY,
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| TraceError::io("Failed to create trace file", path, e))?;

        file.seek(SeekFrom::Start(capacity - 1))
            .map_err(|e| TraceError::io("Failed to stretch trace file", path, e))?;
        file.write_all(&[0])
            .map_err(|e| TraceError::io("Failed to write last byte of trace file", path, e))?;

        // SAFETY: the file was just created by us and is not resized while mapped.
        let mut mmap = unsafe { MmapOptions::new().len(map_len).map_mut(&file) }
            .map_err(|e| TraceError::io("Failed to memory-map trace file", path, e))?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            TraceError::io(
                "Failed to memory-map trace file",
                path,
                std::io::Error::other("mapping returned a null address"),
            )
        })?;

        let buffer = TraceBuffer {
            path: path.to_path_buf(),
            capacity,
            base,
            mmap,
            closed: AtomicBool::new(false),
            truncated_at: AtomicU64::new(u64::MAX),
            final_len: Mutex::new(None),
        };
        buffer.cursor().store(HEADER_LEN, Ordering::SeqCst);

        tracing::debug!(path = %path.display(), capacity, "trace buffer mapped");
        Ok(buffer)
    }

    fn cursor(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page-aligned and at least MIN_CAPACITY bytes long,
        // and the header word is only ever accessed atomically while mapped.
        unsafe { AtomicU64::from_ptr(self.base.as_ptr().cast::<u64>()) }
    }

    /// Claim `n_bytes` of exclusive space
    ///
    /// Never blocks. Returns the start offset of the caller's region, or
    /// `CapacityExceeded` when the region would not fit (see the module docs).
    pub fn reserve(&self, n_bytes: u64) -> Result<Reservation<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TraceError::Closed);
        }

        let start = self.cursor().fetch_add(n_bytes, Ordering::AcqRel);
        match start.checked_add(n_bytes) {
            Some(end) if end <= self.capacity => Ok(Reservation {
                buffer: self,
                offset: start,
                len: n_bytes,
            }),
            _ => {
                self.truncated_at.fetch_min(start, Ordering::AcqRel);
                Err(TraceError::CapacityExceeded {
                    requested: n_bytes,
                    offset: start,
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Reserve exactly `bytes.len()` bytes and copy `bytes` in
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let reservation = self.reserve(bytes.len() as u64)?;
        let offset = reservation.offset();
        reservation.write(bytes);
        Ok(offset)
    }

    /// Finalize the trace and return its logical length
    ///
    /// Stores the length into the header slot and flushes the mapping. Writers must
    /// have finished before this is called. Later calls return the same length and
    /// all later reservations fail with [`TraceError::Closed`]. The mapping itself
    /// is released on drop.
    pub fn close(&self) -> Result<u64> {
        let mut final_len = self
            .final_len
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(len) = *final_len {
            return Ok(len);
        }

        self.closed.store(true, Ordering::Release);
        let cursor = self.cursor().load(Ordering::Acquire);
        let len = cursor
            .min(self.truncated_at.load(Ordering::Acquire))
            .min(self.capacity);
        self.cursor().store(len, Ordering::Release);
        *final_len = Some(len);

        self.mmap
            .flush()
            .map_err(|e| TraceError::io("Failed to flush trace file", &self.path, e))?;

        if self.is_truncated() {
            tracing::warn!(
                path = %self.path.display(),
                len,
                capacity = self.capacity,
                "trace closed truncated: capacity was exceeded"
            );
        }
        Ok(len)
    }

    /// Current cursor offset (next free byte, or the final length after close)
    pub fn position(&self) -> u64 {
        self.cursor().load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once any reservation has been refused for lack of space
    pub fn is_truncated(&self) -> bool {
        self.truncated_at.load(Ordering::Acquire) != u64::MAX
    }

    /// Copy `len` bytes starting at `offset` out of the mapping
    ///
    /// Bytes of a reservation are only stable once its writer has finished.
    pub fn read_at(&self, offset: u64, len: u64) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.capacity {
            return None;
        }
        let mut out = vec![0u8; len as usize];
        // SAFETY: `[offset, end)` is inside the mapping (checked above).
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Some(out)
    }
}

/// An exclusive, in-bounds byte range handed out by [`TraceBuffer::reserve`]
#[must_use = "a reservation that is never written leaves a hole in the trace"]
pub struct Reservation<'a> {
    buffer: &'a TraceBuffer,
    offset: u64,
    len: u64,
}

impl Reservation<'_> {
    /// Start offset of the range from the beginning of the mapping
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill the range with `bytes`
    ///
    /// Callers compute the exact length before reserving; a shorter slice leaves the
    /// tail zeroed and a longer one is cut to the reserved length.
    pub fn write(self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len() as u64, self.len, "record length changed after reserve");
        let n = bytes.len().min(self.len as usize);
        // SAFETY: `reserve` proved `[offset, offset + len)` lies inside the mapping
        // and the atomic cursor gives this range to exactly one reservation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.buffer.base.as_ptr().add(self.offset as usize),
                n,
            );
        }
    }
}
