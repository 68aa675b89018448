//! Synthetic workload for exercising a recorder end to end
//!
//! Stands in for the instrumentation layer: a fake image exposes every configured
//! phase and silence routine, worker threads issue loads and two-step stores, and
//! every 64th access runs inside a silenced routine.

use crate::recorder::Recorder;
use std::collections::HashMap;

const PHASE_BASE: u64 = 0x0040_1000;
const SILENCE_BASE: u64 = 0x0040_9000;
const QUEUE_BASE: u64 = 0x0060_1040;
const HEAP_BASE: u64 = 0x7f00_0000_0000;

/// Shape of the generated workload
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    pub threads: u32,
    pub accesses_per_phase: u64,
}

/// Fake symbol table covering every routine the recorder is configured for
pub fn synthetic_image(recorder: &Recorder) -> HashMap<String, u64> {
    let config = recorder.config();
    let phases = config
        .phases
        .iter()
        .enumerate()
        .map(|(i, p)| (p.routine.clone(), PHASE_BASE + i as u64 * 0x100));
    let silence = config
        .silence_routines
        .iter()
        .enumerate()
        .map(|(i, r)| (r.clone(), SILENCE_BASE + i as u64 * 0x100));
    phases.chain(silence).collect()
}

/// Run every configured phase in order, each with `workload.threads` workers
///
/// Main-thread callbacks use thread id 0; workers use 1..=threads.
pub fn run(recorder: &Recorder, workload: Workload) {
    let image = synthetic_image(recorder);
    let bindings = recorder.on_image_load(&image);
    let silence = bindings.silence.first().map(|(_, addr)| *addr);

    recorder.on_thread_start(0);
    for phase in &bindings.phases {
        recorder.on_routine_entry(0, phase.address, 0);

        std::thread::scope(|s| {
            for tid in 1..=workload.threads {
                s.spawn(move || worker(recorder, tid, workload.accesses_per_phase, silence));
            }
        });
    }
    recorder.on_thread_fini(0);
}

fn worker(recorder: &Recorder, tid: u32, accesses: u64, silence: Option<u64>) {
    recorder.on_thread_start(tid);
    let base = HEAP_BASE + u64::from(tid) * 0x10_0000;

    for i in 0..accesses {
        let ip = 0x0040_0000 + (i % 64) * 4;
        let address = base + i * 8;

        match (i % 64 == 63, silence) {
            (true, Some(routine)) => {
                let queue = QUEUE_BASE + u64::from(tid % 2) * 0x40;
                recorder.on_routine_entry(tid, routine, queue);
                recorder.on_memory_read(tid, ip, queue, false);
                recorder.on_routine_exit(tid, routine);
            }
            _ => {
                recorder.on_memory_read(tid, ip, address, i % 128 == 5);
                recorder.on_memory_write_before(tid, address);
                recorder.on_memory_write_after(tid, ip + 2);
            }
        }
    }
    recorder.on_thread_fini(tid);
}
