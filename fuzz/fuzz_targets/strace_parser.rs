#![no_main]

use std::io::Cursor;
use std::path::Path;

use build_tracer::strace::StraceParser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Trace files are adversarial input; the parser may reject them but
    // must never panic.
    let parser = StraceParser::new();
    let _ = parser.parse_reader(1, Cursor::new(data), Path::new("fuzz-input"));
});
