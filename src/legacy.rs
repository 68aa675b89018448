//! Legacy human-readable trace format
//!
//! One line per event, written sequentially under a single mutex:
//!
//! ```text
//! #
//! # Memory Access Trace Generated By Pin
//! #
//! [0]0x4005d0: R 0x7ffd1a2b3c40
//! === map ===
//! [1]0x4005e4: W 0x601040
//! #eof
//! ```
//!
//! Every writer serializes on the lock, so this mode is far slower than the mapped
//! buffer. It exists for tools that consume the older text traces.

use crate::error::{Result, TraceError};
use crate::record::AccessKind;
use crate::sink::TraceSink;
use regex::Regex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Banner written at the top of every text trace
pub const TEXT_HEADER: &str = "#\n# Memory Access Trace Generated By Pin\n#\n";

/// Mutex-serialized text trace writer
pub struct TextTrace {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    bytes_written: AtomicU64,
}

impl TextTrace {
    /// Create (or truncate) `path` and write the banner
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| TraceError::io("Failed to create text trace", path, e))?;
        let trace = TextTrace {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            bytes_written: AtomicU64::new(0),
        };
        trace.write_line(TEXT_HEADER.trim_end_matches('\n'))?;
        Ok(trace)
    }

    fn lock(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.lock();
        writeln!(writer, "{line}")
            .map_err(|e| TraceError::io("Failed to write text trace", &self.path, e))?;
        self.bytes_written
            .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Format one access line: `[tid]0xip: K 0xaddr`
pub fn format_access(thread_id: u8, ip: u64, kind: AccessKind, address: u64) -> String {
    format!("[{thread_id}]{ip:#x}: {kind} {address:#x}")
}

impl TraceSink for TextTrace {
    fn write_access(&self, thread_id: u8, ip: u64, kind: AccessKind, address: u64) -> Result<()> {
        self.write_line(&format_access(thread_id, ip, kind, address))
    }

    fn write_phase(&self, name: &str) -> Result<()> {
        self.write_line(&format!("=== {name} ==="))
    }

    fn write_eof(&self) -> Result<()> {
        // unterminated, like the binary marker
        let mut writer = self.lock();
        writer
            .write_all(b"#eof")
            .map_err(|e| TraceError::io("Failed to write text trace", &self.path, e))?;
        self.bytes_written.fetch_add(4, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> Result<u64> {
        self.lock()
            .flush()
            .map_err(|e| TraceError::io("Failed to flush text trace", &self.path, e))?;
        Ok(self.bytes_written.load(Ordering::Relaxed))
    }

    fn kind(&self) -> &'static str {
        "text"
    }
}

/// One parsed line of a text trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextLine {
    Access {
        thread_id: u32,
        ip: u64,
        kind: AccessKind,
        address: u64,
    },
    Phase(String),
    Eof,
    Comment,
}

/// Parser for text traces
pub struct TextTraceParser {
    access: Regex,
    phase: Regex,
}

impl TextTraceParser {
    pub fn new() -> Result<Self> {
        let access = Regex::new(r"^\[(\d+)\](0x[0-9a-f]+|0): ([WR]) (0x[0-9a-f]+|0)$")
            .map_err(|e| TraceError::Config(e.to_string()))?;
        // older traces spell the marker "=== PHASE : name ==="
        let phase = Regex::new(r"^=== (?:PHASE : )?(.*) ===$")
            .map_err(|e| TraceError::Config(e.to_string()))?;
        Ok(TextTraceParser { access, phase })
    }

    /// Parse one line (without its newline); `None` if it is not a trace line
    pub fn parse_line(&self, line: &str) -> Option<TextLine> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "#eof" {
            return Some(TextLine::Eof);
        }
        if line.starts_with('#') {
            return Some(TextLine::Comment);
        }
        if let Some(caps) = self.access.captures(line) {
            let kind = AccessKind::from_byte(caps[3].as_bytes()[0])?;
            return Some(TextLine::Access {
                thread_id: caps[1].parse().ok()?,
                ip: parse_hex(&caps[2])?,
                kind,
                address: parse_hex(&caps[4])?,
            });
        }
        self.phase
            .captures(line)
            .map(|caps| TextLine::Phase(caps[1].to_string()))
    }

    /// Parse a whole text trace, failing on the first unrecognised line
    pub fn parse(&self, text: &str) -> Result<Vec<TextLine>> {
        let mut offset = 0u64;
        let mut lines = Vec::new();
        for line in text.split_inclusive('\n') {
            if !line.trim().is_empty() {
                let parsed = self.parse_line(line).ok_or_else(|| TraceError::Decode {
                    offset,
                    reason: format!("unrecognised text trace line {:?}", line.trim_end()),
                })?;
                lines.push(parsed);
            }
            offset += line.len() as u64;
        }
        Ok(lines)
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}
