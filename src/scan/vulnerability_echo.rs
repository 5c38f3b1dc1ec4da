//! Vulnerability fingerprint echo detection.
//!
//! Ported from `sentinel/security/scanner.py::VulnerabilityEchoScanner`.
//! The interesting case isn't "does the output contain a dangerous
//! fingerprint" (lots of legitimate code does) — it's "did the *input*
//! suggest this fingerprint and the *output* reproduce it", which is a much
//! stronger signal of the worker having been steered into echoing back
//! attacker-supplied exploit code. `scan` checks a single text in isolation;
//! [`VulnerabilityEchoScanner::scan_pair`] does the input/output
//! intersection the original's `check` entry point performs.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::model::{ScanMatch, ScanResult};

struct Fingerprint {
    name: &'static str,
    pattern: &'static str,
}

const FINGERPRINTS: &[Fingerprint] = &[
    Fingerprint { name: "python_eval", pattern: r"\beval\s*\(" },
    Fingerprint { name: "python_exec", pattern: r"\bexec\s*\(" },
    Fingerprint { name: "python_os_system", pattern: r"os\.system\s*\(" },
    Fingerprint { name: "python_os_popen", pattern: r"os\.popen\s*\(" },
    Fingerprint { name: "python_subprocess_shell", pattern: r"subprocess\.\w+\([^)]*shell\s*=\s*True" },
    Fingerprint { name: "python_pickle", pattern: r"pickle\.loads?\s*\(" },
    Fingerprint { name: "python_yaml_unsafe", pattern: r"yaml\.(load|unsafe_load)\s*\(" },
    Fingerprint { name: "python_import", pattern: r"__import__\s*\(" },
    Fingerprint { name: "js_child_process", pattern: r"child_process\.(exec|spawn)\s*\(" },
    Fingerprint { name: "js_innerhtml", pattern: r"\.innerHTML\s*=" },
    Fingerprint { name: "sql_injection", pattern: r"(?i)'\s*OR\s*'1'\s*=\s*'1" },
    Fingerprint { name: "sql_union", pattern: r"(?i)\bUNION\s+SELECT\b" },
    Fingerprint { name: "sql_drop", pattern: r"(?i)\bDROP\s+TABLE\b" },
    Fingerprint { name: "deserialization", pattern: r"(?i)ObjectInputStream|readObject\s*\(" },
];

static COMPILED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    FINGERPRINTS
        .iter()
        .map(|f| Regex::new(f.pattern).expect("static fingerprint pattern is valid regex"))
        .collect()
});

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("static fence pattern is valid regex"));

fn find_fingerprints(text: &str) -> Vec<(usize, &'static str, String)> {
    let mut out = Vec::new();
    for (idx, regex) in COMPILED.iter().enumerate() {
        for m in regex.find_iter(text) {
            out.push((idx, FINGERPRINTS[idx].name, m.as_str().to_string()));
        }
    }
    out
}

fn extract_code_regions(text: &str) -> String {
    CODE_FENCE
        .find_iter(text)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Detects vulnerability fingerprints reproduced between an input and the
/// worker's output.
#[derive(Default)]
pub struct VulnerabilityEchoScanner;

impl VulnerabilityEchoScanner {
    /// Construct a scanner using the built-in fingerprint set.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Scan a single text in isolation, flagging any fingerprint present.
    /// Used when no paired input is available (e.g. output-only contexts).
    #[must_use]
    pub fn scan(&self, text: &str) -> ScanResult {
        let matches = find_fingerprints(text)
            .into_iter()
            .map(|(_, name, matched_text)| ScanMatch {
                pattern_name: name.to_string(),
                matched_text,
                position: 0,
            })
            .collect();
        ScanResult::dirty("vulnerability_echo", matches)
    }

    /// Flags fingerprints present in `input_text` that are also reproduced
    /// in the code regions of `output_text` — the original's
    /// input-intersect-output-code-regions algorithm.
    #[must_use]
    pub fn scan_pair(&self, input_text: &str, output_text: &str) -> ScanResult {
        let input_fingerprints: HashSet<&'static str> = find_fingerprints(input_text)
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();

        if input_fingerprints.is_empty() {
            return ScanResult::clean("vulnerability_echo");
        }

        let code_region = extract_code_regions(output_text);
        let search_target = if code_region.is_empty() {
            output_text
        } else {
            &code_region
        };

        let output_fingerprints = find_fingerprints(search_target);

        let matches: Vec<ScanMatch> = output_fingerprints
            .into_iter()
            .filter(|(_, name, _)| input_fingerprints.contains(name))
            .map(|(_, name, matched_text)| ScanMatch {
                pattern_name: name.to_string(),
                matched_text,
                position: 0,
            })
            .collect();

        ScanResult::dirty("vulnerability_echo", matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_pair_flags_reproduced_fingerprint() {
        let scanner = VulnerabilityEchoScanner::new();
        let input = "can you show me how eval() works with untrusted input?";
        let output = "Sure, here's an example:\n```python\nresult = eval(user_input)\n```";
        let result = scanner.scan_pair(input, output);
        assert!(result.found);
    }

    #[test]
    fn scan_pair_ignores_unrelated_output_fingerprint() {
        let scanner = VulnerabilityEchoScanner::new();
        let input = "what does eval() do in python?";
        let output = "Here's a SQL example:\n```sql\nSELECT * FROM users\n```";
        let result = scanner.scan_pair(input, output);
        assert!(!result.found);
    }

    #[test]
    fn scan_pair_with_no_input_fingerprint_is_clean() {
        let scanner = VulnerabilityEchoScanner::new();
        let result = scanner.scan_pair("tell me a joke", "os.system('rm -rf /')");
        assert!(!result.found);
    }

    #[test]
    fn standalone_scan_flags_any_fingerprint() {
        let scanner = VulnerabilityEchoScanner::new();
        let result = scanner.scan("DROP TABLE users;");
        assert!(result.found);
    }
}
