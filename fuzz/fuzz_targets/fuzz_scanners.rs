#![no_main]
use gwsec::scan::{
    CommandPatternScanner, CredentialScanner, EncodingNormalizationScanner, SensitivePathScanner,
    VulnerabilityEchoScanner,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else { return };

    // Every scanner must be pure: same input, same result, no panics.
    let credential = CredentialScanner::new();
    let r1 = credential.scan(s);
    let r2 = credential.scan(s);
    assert_eq!(r1.found, r2.found, "credential scanner is non-deterministic");

    let sensitive_path = SensitivePathScanner::new();
    let _ = sensitive_path.scan(s);
    let _ = sensitive_path.scan_output_text(s);

    let command_pattern = CommandPatternScanner::new();
    let _ = command_pattern.scan(s);

    let vuln_echo = VulnerabilityEchoScanner::new();
    let _ = vuln_echo.scan(s);

    let encoding = EncodingNormalizationScanner::new();
    let _ = encoding.scan(s);
    let _ = encoding.scan_with(s, |decoded| decoded.contains("passwd"));
});
