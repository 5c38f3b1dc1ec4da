#![no_main]
use gwsec::spotlight::{apply_datamarking, remove_datamarking, wrap_untrusted_data};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else { return };

    let marker = "\u{2060}";
    let marked = apply_datamarking(s, marker);
    assert_eq!(marked, apply_datamarking(s, marker), "datamarking is non-deterministic");

    // Round trip only holds when the input doesn't already contain the
    // marker character mid-token; that case is exercised directly above.
    if !s.contains(marker) {
        assert_eq!(remove_datamarking(&marked, marker), s, "marker round trip changed the text");
    }

    let _ = wrap_untrusted_data(s);
});
