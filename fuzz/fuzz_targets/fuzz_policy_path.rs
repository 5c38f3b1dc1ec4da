#![no_main]
use std::path::PathBuf;
use std::sync::LazyLock;

use gwsec::policy::{CommandPolicy, FileAccessPolicy, PolicyEngine};
use libfuzzer_sys::fuzz_target;

static ENGINE: LazyLock<PolicyEngine> = LazyLock::new(|| {
    PolicyEngine::new(
        FileAccessPolicy {
            blocked_patterns: vec!["**/*.env".to_string()],
            read_allowed: vec!["/workspace/**".to_string(), "/workspace".to_string()],
            write_allowed: vec!["/workspace/**".to_string(), "/workspace".to_string()],
            workspace_root: PathBuf::from("/workspace"),
        },
        CommandPolicy {
            allowed_commands: vec!["echo".to_string(), "cat".to_string()],
            path_constrained: vec!["cat".to_string()],
            blocked_patterns: vec![],
        },
    )
});

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else { return };

    // Traversal/allowlist checks must never panic on arbitrary path text,
    // and must agree with themselves across repeated calls.
    let r1 = ENGINE.check_file_read(s);
    let r2 = ENGINE.check_file_read(s);
    assert_eq!(r1.is_allowed(), r2.is_allowed(), "file-read policy decision is non-deterministic");

    let _ = ENGINE.check_file_write(s);
    let _ = ENGINE.check_command(s);
});
