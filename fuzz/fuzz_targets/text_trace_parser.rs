#![no_main]

use libfuzzer_sys::fuzz_target;
use memtrace::legacy::TextTraceParser;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(parser) = TextTraceParser::new() {
            let _ = parser.parse(input);
        }
    }
});
