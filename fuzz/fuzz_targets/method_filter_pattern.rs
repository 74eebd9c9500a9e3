#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowtrace::collaborators::StaticNameResolver;
use shadowtrace::method_filter::MethodFilter;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if let Ok(pattern) = std::str::from_utf8(data) {
        let names = StaticNameResolver::new()
            .with_name(1, "MyApp.Main")
            .with_name(2, "System.Collections.Generic.List`1.Add");
        // Invalid patterns fall back to recording everything
        let filter = MethodFilter::from_pattern(Some(pattern), Arc::new(names));
        let _ = filter.should_record(1);
        let _ = filter.should_record(2);
        let _ = filter.should_record(3);
    }
});
