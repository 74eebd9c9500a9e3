#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowtrace::serializer::binary::read_capture;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must parse or fail cleanly, never panic
    let _ = read_capture(&mut Cursor::new(data));
});
