#![no_main]

use libfuzzer_sys::fuzz_target;
use memtrace::record::TraceReader;

fuzz_target!(|data: &[u8]| {
    // Decoding a crashed or corrupted trace must fail cleanly, never panic
    if let Ok(reader) = TraceReader::new(data) {
        for event in reader {
            if event.is_err() {
                break;
            }
        }
    }
});
