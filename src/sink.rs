//! Output backends for the event encoder
//!
//! The encoder decides *whether* and *what* to record; a [`TraceSink`] decides how the
//! bytes reach storage. The primary sink is the lock-free [`TraceBuffer`]; the legacy
//! text writer in [`crate::legacy`] is the lower-throughput alternative.

use crate::error::Result;
use crate::record::{phase_marker, phase_marker_len, AccessKind, AccessRecord, EOF_MARKER};
use crate::trace_buffer::TraceBuffer;

/// Destination for encoded trace events
///
/// Implementations must accept calls from any number of threads at once.
pub trait TraceSink: Send + Sync {
    /// Record one memory access. `ip` is the instruction pointer; binary sinks drop it.
    fn write_access(&self, thread_id: u8, ip: u64, kind: AccessKind, address: u64) -> Result<()>;

    /// Record entry into the phase called `name`
    fn write_phase(&self, name: &str) -> Result<()>;

    /// Write the terminal marker
    fn write_eof(&self) -> Result<()>;

    /// Flush and finalize; returns the number of meaningful bytes in the output
    fn finish(&self) -> Result<u64>;

    /// Short name for reports and logs
    fn kind(&self) -> &'static str;
}

impl TraceSink for TraceBuffer {
    fn write_access(&self, thread_id: u8, _ip: u64, kind: AccessKind, address: u64) -> Result<()> {
        let bytes = AccessRecord::new(thread_id, kind, address).encode();
        self.reserve(bytes.len() as u64)?.write(&bytes);
        Ok(())
    }

    fn write_phase(&self, name: &str) -> Result<()> {
        let len = phase_marker_len(name);
        let reservation = self.reserve(len)?;
        reservation.write(phase_marker(name).as_bytes());
        Ok(())
    }

    fn write_eof(&self) -> Result<()> {
        self.append(EOF_MARKER).map(|_| ())
    }

    fn finish(&self) -> Result<u64> {
        self.close()
    }

    fn kind(&self) -> &'static str {
        "mapped"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{TraceEvent, TraceReader, HEADER_LEN};
    use tempfile::TempDir;

    #[test]
    fn test_mapped_sink_writes_decodable_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.bin");
        let buffer = TraceBuffer::open(&path, 4096).unwrap();
        let sink: &dyn TraceSink = &buffer;

        sink.write_phase("map").unwrap();
        sink.write_access(4, 0x4005d0, AccessKind::Read, 0x7fff_0000).unwrap();
        sink.write_eof().unwrap();
        let len = sink.finish().unwrap();
        assert_eq!(len, HEADER_LEN + 12 + 10 + 4);
        assert_eq!(sink.kind(), "mapped");
        drop(buffer);

        let data = std::fs::read(&path).unwrap();
        let events: Vec<_> = TraceReader::new(&data)
            .unwrap()
            .collect_events()
            .unwrap()
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        assert_eq!(
            events,
            vec![
                TraceEvent::Phase("map"),
                TraceEvent::Access(AccessRecord::new(4, AccessKind::Read, 0x7fff_0000)),
                TraceEvent::Eof,
            ]
        );
    }

    #[test]
    fn test_mapped_sink_reports_overrun() {
        let dir = TempDir::new().unwrap();
        let buffer = TraceBuffer::open(dir.path().join("t.bin"), 16).unwrap();
        assert!(buffer.write_access(1, 0, AccessKind::Write, 1).is_err());
        assert!(buffer.is_truncated());
    }
}
