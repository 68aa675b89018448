//! End-to-end recording sessions
//!
//! Each test drives a `Recorder` the way the instrumentation layer would and then
//! decodes the resulting trace file.

use memtrace::config::{Backend, RecorderConfig};
use memtrace::encoder::AddressMode;
use memtrace::legacy::{TextLine, TextTraceParser};
use memtrace::record::{AccessKind, AccessRecord, TraceEvent, TraceReader, HEADER_LEN};
use memtrace::suppression::OverflowPolicy;
use memtrace::watchdog::{TerminationReport, WatchdogConfig, WatchdogMode};
use memtrace::Recorder;
use serial_test::serial;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const MAP: u64 = 0x401000;
const REDUCE: u64 = 0x401100;
const MERGE: u64 = 0x401200;
const TQ_DEQUEUE: u64 = 0x409000;

fn image() -> HashMap<String, u64> {
    [
        ("map", MAP),
        ("reduce", REDUCE),
        ("merge", MERGE),
        ("tq_dequeue", TQ_DEQUEUE),
    ]
    .into_iter()
    .map(|(name, addr)| (name.to_string(), addr))
    .collect()
}

fn quiet_config(dir: &TempDir) -> RecorderConfig {
    RecorderConfig {
        capacity_bytes: 64 * 1024,
        watchdog: WatchdogConfig {
            enabled: false,
            ..WatchdogConfig::default()
        },
        ..RecorderConfig::with_output(dir.path().join("trace.bin"))
    }
}

/// Decode every event of a finished binary trace into owned form
fn decode(path: &Path) -> Vec<OwnedEvent> {
    let data = std::fs::read(path).unwrap();
    TraceReader::new(&data)
        .unwrap()
        .collect_events()
        .unwrap()
        .into_iter()
        .map(|(_, event)| match event {
            TraceEvent::Access(r) => OwnedEvent::Access(r),
            TraceEvent::Phase(name) => OwnedEvent::Phase(name.to_string()),
            TraceEvent::Heartbeat => OwnedEvent::Heartbeat,
            TraceEvent::Eof => OwnedEvent::Eof,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OwnedEvent {
    Access(AccessRecord),
    Phase(String),
    Heartbeat,
    Eof,
}

// ============================================================================
// Suppression
// ============================================================================

#[test]
fn test_suppressed_thread_leaves_no_records() {
    let dir = TempDir::new().unwrap();
    let config = quiet_config(&dir);
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();
    recorder.on_image_load(&image());

    let (thread_a, thread_b) = (3u32, 4u32);
    recorder.on_routine_entry(thread_a, TQ_DEQUEUE, 0x601040);

    std::thread::scope(|s| {
        s.spawn(|| recorder.on_memory_read(thread_a, 0x400500, 0x7000, false));
        s.spawn(|| recorder.on_memory_read(thread_b, 0x400504, 0x7008, false));
    });
    recorder.on_routine_exit(thread_a, TQ_DEQUEUE);

    let report = recorder.finish().unwrap();
    assert_eq!(report.encoder.recorded, 1);
    assert_eq!(report.encoder.suppressed, 1);
    assert_eq!(report.logical_length, HEADER_LEN + 10 + 4);

    assert_eq!(
        decode(&path),
        vec![
            OwnedEvent::Access(AccessRecord::new(4, AccessKind::Read, 0x7008)),
            OwnedEvent::Eof,
        ]
    );
}

#[test]
fn test_silence_counts_follow_queue_keys() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::start(quiet_config(&dir)).unwrap();
    recorder.on_image_load(&image());

    for (tid, key) in [(1, 0x601040u64), (2, 0x601040), (1, 0x601080)] {
        recorder.on_routine_entry(tid, TQ_DEQUEUE, key);
        recorder.on_memory_read(tid, 0, key, false);
        recorder.on_routine_exit(tid, TQ_DEQUEUE);
    }

    let report = recorder.finish().unwrap();
    assert_eq!(report.silence_counts.get(&0x601040), Some(&2));
    assert_eq!(report.silence_counts.get(&0x601080), Some(&1));
    assert_eq!(report.encoder.suppressed, 3);
    assert!(report.to_string().contains("0x601080 , 1"));
}

#[test]
fn test_thread_beyond_table_is_rejected_under_reject_policy() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        max_threads: 2,
        overflow_policy: OverflowPolicy::Reject,
        ..quiet_config(&dir)
    };
    let recorder = Recorder::start(config).unwrap();

    recorder.on_memory_read(1, 0, 0x10, false);
    recorder.on_memory_read(7, 0, 0x20, false);

    let report = recorder.finish().unwrap();
    assert_eq!(report.encoder.recorded, 1);
    assert_eq!(report.encoder.rejected, 1);
    assert_eq!(report.out_of_range_thread_events, 1);
}

#[test]
fn test_thread_beyond_table_is_recorded_fail_open() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        max_threads: 2,
        ..quiet_config(&dir)
    };
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();

    recorder.on_memory_read(300, 0, 0x20, false);

    let report = recorder.finish().unwrap();
    assert_eq!(report.encoder.recorded, 1);
    assert_eq!(report.out_of_range_thread_events, 1);
    // 300 does not fit in the one-byte field
    assert_eq!(
        decode(&path)[0],
        OwnedEvent::Access(AccessRecord::new(255, AccessKind::Read, 0x20))
    );
}

// ============================================================================
// Phases and writes
// ============================================================================

#[test]
fn test_phase_markers_in_entry_order() {
    let dir = TempDir::new().unwrap();
    let config = quiet_config(&dir);
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();
    let bindings = recorder.on_image_load(&image());
    assert_eq!(bindings.phases.len(), 3);

    for routine in [MAP, REDUCE, MERGE] {
        recorder.on_routine_entry(0, routine, 0);
    }
    recorder.finish().unwrap();

    assert_eq!(
        decode(&path),
        vec![
            OwnedEvent::Phase("map".to_string()),
            OwnedEvent::Phase("reduce".to_string()),
            OwnedEvent::Phase("merge".to_string()),
            OwnedEvent::Eof,
        ]
    );
}

#[test]
fn test_interleaved_writes_keep_their_own_address() {
    let dir = TempDir::new().unwrap();
    let config = quiet_config(&dir);
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();

    // both threads park a store before either confirms
    recorder.on_memory_write_before(1, 0xaaaa);
    recorder.on_memory_write_before(2, 0xbbbb);
    recorder.on_memory_write_after(2, 0x40);
    recorder.on_memory_write_after(1, 0x44);
    // predicate false: nothing parked
    recorder.on_memory_write_after(1, 0x48);

    let report = recorder.finish().unwrap();
    assert_eq!(report.encoder.recorded, 2);
    assert_eq!(report.encoder.unmatched_confirms, 1);
    assert_eq!(
        decode(&path)[..2],
        [
            OwnedEvent::Access(AccessRecord::new(2, AccessKind::Write, 0xbbbb)),
            OwnedEvent::Access(AccessRecord::new(1, AccessKind::Write, 0xaaaa)),
        ]
    );
}

#[test]
fn test_page_mode_and_prefetch_filter() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        address_mode: AddressMode::Page,
        ..quiet_config(&dir)
    };
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();

    recorder.on_memory_read(1, 0, 0x7fff_1234, false);
    recorder.on_memory_read(1, 0, 0x7fff_5678, true);

    let report = recorder.finish().unwrap();
    assert_eq!(report.encoder.prefetch_skipped, 1);
    assert_eq!(
        decode(&path)[0],
        OwnedEvent::Access(AccessRecord::new(1, AccessKind::Read, 0x7fff_1000))
    );
}

#[test]
fn test_full_buffer_degrades_report() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        capacity_bytes: HEADER_LEN + 30,
        ..quiet_config(&dir)
    };
    let recorder = Recorder::start(config).unwrap();

    for i in 0..5 {
        recorder.on_memory_read(1, 0, i, false);
    }

    let report = recorder.finish().unwrap();
    assert_eq!(report.encoder.recorded, 3);
    assert_eq!(report.encoder.dropped, 2);
    assert!(!report.eof_written);
    assert!(report.truncated);
    assert!(report.is_degraded());
    assert_eq!(report.logical_length, HEADER_LEN + 30);
    assert!(report.to_string().contains("WARNING: trace is truncated"));
}

#[test]
fn test_legacy_text_session_parses_back() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        backend: Backend::Text,
        output: dir.path().join("trace.out"),
        ..quiet_config(&dir)
    };
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();
    recorder.on_image_load(&image());
    recorder.on_routine_entry(0, MAP, 0);
    recorder.on_memory_read(2, 0x4005d0, 0x601040, false);
    recorder.on_memory_write_before(2, 0x601048);
    recorder.on_memory_write_after(2, 0x4005d4);
    recorder.finish().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines = TextTraceParser::new().unwrap().parse(&text).unwrap();
    let lines: Vec<_> = lines
        .into_iter()
        .filter(|l| *l != TextLine::Comment)
        .collect();
    assert_eq!(
        lines,
        vec![
            TextLine::Phase("map".to_string()),
            TextLine::Access {
                thread_id: 2,
                ip: 0x4005d0,
                kind: AccessKind::Read,
                address: 0x601040,
            },
            TextLine::Access {
                thread_id: 2,
                ip: 0x4005d4,
                kind: AccessKind::Write,
                address: 0x601048,
            },
            TextLine::Eof,
        ]
    );
}

// ============================================================================
// Watchdog
// ============================================================================

fn heartbeats_before_eof(events: &[OwnedEvent]) -> usize {
    let eof = events
        .iter()
        .position(|e| *e == OwnedEvent::Eof)
        .expect("trace has a terminal marker");
    assert_eq!(eof, events.len() - 1);
    events[..eof]
        .iter()
        .filter(|e| **e == OwnedEvent::Heartbeat)
        .count()
}

#[test]
fn test_thread_watchdog_heartbeats_precede_eof() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        watchdog: WatchdogConfig {
            enabled: true,
            mode: WatchdogMode::Thread,
            heartbeats: 5,
            interval_ms: 10,
        },
        ..quiet_config(&dir)
    };
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let report = recorder.finish().unwrap();
    assert_eq!(
        report.watchdog,
        Some(TerminationReport::AlreadyFinished {
            heartbeats: Some(5)
        })
    );
    assert_eq!(heartbeats_before_eof(&decode(&path)), 5);
}

#[test]
#[serial]
fn test_process_watchdog_heartbeats_through_shared_mapping() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        watchdog: WatchdogConfig {
            enabled: true,
            mode: WatchdogMode::Process,
            heartbeats: 5,
            interval_ms: 10,
        },
        ..quiet_config(&dir)
    };
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();
    recorder.on_memory_read(1, 0, 0x1000, false);
    std::thread::sleep(Duration::from_millis(300));

    let report = recorder.finish().unwrap();
    assert_eq!(
        report.watchdog,
        Some(TerminationReport::AlreadyFinished { heartbeats: None })
    );

    let events = decode(&path);
    assert_eq!(heartbeats_before_eof(&events), 5);
    assert!(events.contains(&OwnedEvent::Access(AccessRecord::new(
        1,
        AccessKind::Read,
        0x1000
    ))));
}

#[test]
#[serial]
fn test_process_watchdog_killed_while_running() {
    let dir = TempDir::new().unwrap();
    let config = RecorderConfig {
        watchdog: WatchdogConfig {
            enabled: true,
            mode: WatchdogMode::Process,
            heartbeats: 10_000,
            interval_ms: 20,
        },
        ..quiet_config(&dir)
    };
    let path = config.output.clone();
    let recorder = Recorder::start(config).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let report = recorder.finish().unwrap();
    assert_eq!(
        report.watchdog,
        Some(TerminationReport::Stopped { heartbeats: None })
    );
    // the killed child can no longer append after the terminal marker
    let events = decode(&path);
    assert!(heartbeats_before_eof(&events) >= 1);
}
