//! Binary trace layout: record encoding and decoding
//!
//! A trace file is a single memory-mapped region:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┬─────────────┐
//! │ header (u64) │ packed records, in reservation order          │ unused tail │
//! │ cursor/len   │ access │ access │ === map ===\n │ . │ … │ #eof │ (zeroes)    │
//! └──────────────┴──────────────────────────────────────────────┴─────────────┘
//! 0              8                                              len          capacity
//! ```
//!
//! - Access record (10 bytes): `thread_id: u8, kind: u8 ('R' | 'W'), address: u64 LE`
//! - Phase marker: ASCII `"=== " + name + " ===\n"`
//! - Heartbeat: one sentinel byte written by the liveness watchdog
//! - Terminal marker: ASCII `"#eof"`, written once at shutdown
//!
//! Records carry no length prefix. The decoder tells them apart by the byte after
//! the first one: an access record always has `R` or `W` there, a phase marker has
//! `=`, the terminal marker `e`. A heartbeat immediately followed by an access record
//! from thread 82 or 87 (`'R'`/`'W'`) looks like an access from thread 46 (`'.'`);
//! the reader resolves it by checking which reading leaves the next record aligned,
//! and prefers the heartbeat when both do.

use crate::error::{Result, TraceError};
use std::fmt;

/// Size of the header slot holding the cursor (and, after close, the logical length)
pub const HEADER_LEN: u64 = std::mem::size_of::<u64>() as u64;

/// Size of one encoded access record
pub const ACCESS_RECORD_LEN: u64 = 10;

/// Terminal marker written once at shutdown
pub const EOF_MARKER: &[u8; 4] = b"#eof";

/// Byte written by each watchdog heartbeat
pub const HEARTBEAT_SENTINEL: u8 = b'.';

const PHASE_PREFIX: &str = "=== ";
const PHASE_SUFFIX: &str = " ===\n";

/// Thread id value used for threads whose id does not fit in one byte
pub const SATURATED_THREAD_ID: u8 = u8::MAX;

/// Kind of memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    /// On-disk byte (`'R'` or `'W'`)
    pub fn as_byte(self) -> u8 {
        match self {
            AccessKind::Read => b'R',
            AccessKind::Write => b'W',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'R' => Some(AccessKind::Read),
            b'W' => Some(AccessKind::Write),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// One memory-access record as stored in the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub thread_id: u8,
    pub kind: AccessKind,
    pub address: u64,
}

impl AccessRecord {
    pub fn new(thread_id: u8, kind: AccessKind, address: u64) -> Self {
        AccessRecord {
            thread_id,
            kind,
            address,
        }
    }

    /// Serialize into the fixed 10-byte layout
    pub fn encode(&self) -> [u8; ACCESS_RECORD_LEN as usize] {
        let mut out = [0u8; ACCESS_RECORD_LEN as usize];
        out[0] = self.thread_id;
        out[1] = self.kind.as_byte();
        out[2..].copy_from_slice(&self.address.to_le_bytes());
        out
    }

    /// Parse a record from the first 10 bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ACCESS_RECORD_LEN as usize {
            return None;
        }
        let kind = AccessKind::from_byte(bytes[1])?;
        let mut address = [0u8; 8];
        address.copy_from_slice(&bytes[2..ACCESS_RECORD_LEN as usize]);
        Some(AccessRecord {
            thread_id: bytes[0],
            kind,
            address: u64::from_le_bytes(address),
        })
    }
}

/// Narrow an instrumentation thread id to the one-byte trace field
pub fn trace_thread_id(thread_id: u32) -> u8 {
    u8::try_from(thread_id).unwrap_or(SATURATED_THREAD_ID)
}

/// Format the textual marker for entering `name`
pub fn phase_marker(name: &str) -> String {
    format!("{PHASE_PREFIX}{name}{PHASE_SUFFIX}")
}

/// Exact byte length of `phase_marker(name)`, known before reservation
pub fn phase_marker_len(name: &str) -> u64 {
    (PHASE_PREFIX.len() + name.len() + PHASE_SUFFIX.len()) as u64
}

/// A decoded trace event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent<'a> {
    Access(AccessRecord),
    Phase(&'a str),
    Heartbeat,
    Eof,
}

/// Sequential decoder over a finished (or crashed) binary trace
///
/// The header word bounds decoding: after `close()` it holds the logical length,
/// and for a trace whose writer died it still holds the live cursor. A live cursor
/// that ran past the end of the file (an overrun that was never closed) is clamped
/// to the file size and the reader reports itself truncated; the unwritten zero
/// tail of such a trace ends decoding instead of failing it.
pub struct TraceReader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    truncated: bool,
}

impl<'a> TraceReader<'a> {
    /// Validate the header of `data` and position the reader at the first record
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = data.get(..HEADER_LEN as usize).ok_or_else(|| TraceError::Decode {
            offset: 0,
            reason: format!("trace shorter than its {HEADER_LEN}-byte header"),
        })?;
        let mut word = [0u8; 8];
        word.copy_from_slice(header);
        let logical_len = u64::from_le_bytes(word);

        if logical_len < HEADER_LEN {
            return Err(TraceError::Decode {
                offset: 0,
                reason: format!("header length {logical_len} shorter than the header"),
            });
        }
        let truncated = logical_len > data.len() as u64;
        if truncated {
            tracing::warn!(
                header = logical_len,
                file_len = data.len(),
                "trace header points past the end of the file; decoding what is there"
            );
        }

        Ok(TraceReader {
            data,
            pos: HEADER_LEN as usize,
            end: logical_len.min(data.len() as u64) as usize,
            truncated,
        })
    }

    /// Bytes decoded: the header length, or the file size if the header points past it
    pub fn logical_len(&self) -> u64 {
        self.end as u64
    }

    /// True if the header pointed past the end of the file
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Decode every remaining event, stopping at the first malformed byte
    pub fn collect_events(self) -> Result<Vec<(u64, TraceEvent<'a>)>> {
        self.collect()
    }

    fn fail(&mut self, reason: impl Into<String>) -> TraceError {
        let offset = self.pos as u64;
        self.pos = self.end;
        TraceError::Decode {
            offset,
            reason: reason.into(),
        }
    }

    fn next_event(&mut self) -> Result<TraceEvent<'a>> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..self.end];

        if rest[0] == HEARTBEAT_SENTINEL && heartbeat_precedes_access(rest) {
            self.pos += 1;
            return Ok(TraceEvent::Heartbeat);
        }

        if rest.len() >= 2 && AccessKind::from_byte(rest[1]).is_some() {
            let record = AccessRecord::decode(rest)
                .ok_or_else(|| self.fail("truncated access record"))?;
            self.pos += ACCESS_RECORD_LEN as usize;
            return Ok(TraceEvent::Access(record));
        }

        if rest.starts_with(PHASE_PREFIX.as_bytes()) {
            let newline = rest
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| self.fail("unterminated phase marker"))?;
            let line = &rest[..=newline];
            if line.len() < PHASE_PREFIX.len() + PHASE_SUFFIX.len()
                || !line.ends_with(PHASE_SUFFIX.as_bytes())
            {
                return Err(self.fail("phase marker without closing ' ==='"));
            }
            let name = &line[PHASE_PREFIX.len()..line.len() - PHASE_SUFFIX.len()];
            let name =
                std::str::from_utf8(name).map_err(|_| self.fail("phase name is not UTF-8"))?;
            self.pos += line.len();
            return Ok(TraceEvent::Phase(name));
        }

        if rest.starts_with(EOF_MARKER) {
            self.pos += EOF_MARKER.len();
            return Ok(TraceEvent::Eof);
        }

        if rest[0] == HEARTBEAT_SENTINEL {
            self.pos += 1;
            return Ok(TraceEvent::Heartbeat);
        }

        Err(self.fail(format!("unrecognised record byte {:#04x}", rest[0])))
    }
}

/// True if `rest` can start with a record, or is empty
fn starts_record(rest: &[u8]) -> bool {
    match rest {
        [] => true,
        [_, kind, ..] if AccessKind::from_byte(*kind).is_some() => true,
        [first, ..] => {
            *first == HEARTBEAT_SENTINEL
                || rest.starts_with(PHASE_PREFIX.as_bytes())
                || rest.starts_with(EOF_MARKER)
        }
    }
}

/// Disambiguate `'.'` followed by an `R`/`W` byte
///
/// Read as a heartbeat, the access that follows starts at `rest[1]`; read as an access
/// from thread `'.'`, the next record starts at `rest[10]`. Choose the heartbeat when
/// that reading stays aligned and the other does not, or when both do.
fn heartbeat_precedes_access(rest: &[u8]) -> bool {
    let record = ACCESS_RECORD_LEN as usize;
    if rest.len() < 1 + record || AccessKind::from_byte(rest[2]).is_none() {
        return false;
    }
    starts_record(&rest[1 + record..])
}

impl<'a> Iterator for TraceReader<'a> {
    type Item = Result<(u64, TraceEvent<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        if self.truncated
            && self.data[self.pos] == 0
            && self.data[self.pos..self.end].iter().all(|&b| b == 0)
        {
            self.pos = self.end;
            return None;
        }
        let offset = self.pos as u64;
        Some(self.next_event().map(|event| (offset, event)))
    }
}
