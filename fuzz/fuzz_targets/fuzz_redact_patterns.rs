#![no_main]

use libfuzzer_sys::fuzz_target;

use oasfuzz::logging::redact::{redact_string, Redactor};

fuzz_target!(|data: &str| {
    // Every logged URL and error goes through these patterns; a slow
    // pattern shows up as a libFuzzer timeout.
    let plain = redact_string(data);

    let redactor = Redactor::new().with_secret("fuzz-secret-value");
    let masked = redactor.redact_string(data);
    assert!(!masked.contains("fuzz-secret-value"));

    // Known secrets only ever shrink into the marker, never reappear.
    if !data.contains("fuzz-secret-value") {
        assert_eq!(plain, masked);
    }
});
