//! Sensitive filesystem path detection.
//!
//! Ported from `sentinel/security/scanner.py::SensitivePathScanner`. Input
//! scanning is a strict substring check; output scanning (`scan_output_text`)
//! applies six context-aware escapes so that legitimate documentation
//! ("run `cat /etc/passwd` to inspect it") doesn't trip the same alarm as an
//! attacker trying to exfiltrate a secrets file's actual contents.
//!
//! As in `credential.rs`, the built-in path list is compiled in statically
//! and a policy document's `sensitive_path_patterns` can be layered on top
//! via [`SensitivePathScanner::with_patterns`].

use regex::Regex;
use std::sync::LazyLock;

use crate::model::{ScanMatch, ScanResult};

/// Sensitive path fragments, checked as plain substrings.
const DEFAULT_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "~/.ssh/",
    "/.ssh/id_rsa",
    "/.ssh/id_ed25519",
    "~/.aws/credentials",
    "/.aws/credentials",
    "~/.kube/config",
    "/.kube/config",
    "/.env",
    "/.git/config",
    "/proc/self/environ",
];

static SHELL_PREFIXES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(\$|#|sudo|cat|rm|chmod|chown|ls|cp|mv|mkdir|touch|head|tail|less|more|nano|vi|vim)\b")
        .expect("static shell-prefix pattern is valid regex")
});

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("static fence pattern is valid regex"));

static BULLET_WITH_PROSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*[-*]\s+.*\s+\S").expect("static bullet pattern is valid regex")
});

static DASH_COLON_PROSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^.*[:-]\s+\S.*\s+\S.*$").expect("static dash/colon pattern is valid regex")
});

static YAML_KEY_INDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s{2,}[A-Za-z_][A-Za-z0-9_]*:\s").expect("static yaml-key pattern is valid regex")
});

/// Detects references to well-known sensitive filesystem paths.
#[derive(Default)]
pub struct SensitivePathScanner {
    extra: Vec<String>,
}

impl SensitivePathScanner {
    /// Construct a scanner using only the built-in path list.
    #[must_use]
    pub fn new() -> Self {
        Self { extra: Vec::new() }
    }

    /// Construct a scanner layering `patterns` — additional path fragments
    /// from a policy document's `sensitive_path_patterns` — on top of the
    /// built-in list. Unlike credential patterns these are checked as plain
    /// substrings, so there is nothing to compile and no way for this to fail.
    #[must_use]
    pub fn with_patterns(patterns: Vec<String>) -> Self {
        Self { extra: patterns }
    }

    fn all_paths(&self) -> impl Iterator<Item = &str> {
        DEFAULT_PATHS.iter().copied().chain(self.extra.iter().map(String::as_str))
    }

    /// Strict substring scan, used for input text — no escapes applied.
    #[must_use]
    pub fn scan(&self, text: &str) -> ScanResult {
        let mut matches = Vec::new();
        let lower = text.to_lowercase();
        for path in self.all_paths() {
            let mut search_from = 0;
            let needle = path.to_lowercase();
            while let Some(offset) = lower[search_from..].find(&needle) {
                let position = search_from + offset;
                matches.push(ScanMatch {
                    pattern_name: path.to_string(),
                    matched_text: path.to_string(),
                    position,
                });
                search_from = position + needle.len();
            }
        }
        ScanResult::dirty("sensitive_path", matches)
    }

    /// Context-aware scan for worker output text, applying the six escapes
    /// ported from `scan_output_text`: fenced code blocks, shell-prefixed
    /// lines, standalone-path-only lines, bulleted prose, dash/colon prose,
    /// and indented YAML keys are all treated as benign mentions rather
    /// than exfiltration attempts.
    #[must_use]
    pub fn scan_output_text(&self, text: &str) -> ScanResult {
        let fenced_spans: Vec<(usize, usize)> = FENCE
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();

        let mut matches = Vec::new();
        let lower = text.to_lowercase();

        for path in self.all_paths() {
            let needle = path.to_lowercase();
            let mut search_from = 0;
            while let Some(offset) = lower[search_from..].find(&needle) {
                let position = search_from + offset;
                search_from = position + needle.len();

                if fenced_spans.iter().any(|(s, e)| position >= *s && position < *e) {
                    continue;
                }

                let line = line_containing(text, position);

                if SHELL_PREFIXES.is_match(line) {
                    continue;
                }
                if is_standalone_path_line(line) {
                    continue;
                }
                if BULLET_WITH_PROSE.is_match(line) {
                    continue;
                }
                if DASH_COLON_PROSE.is_match(line) {
                    continue;
                }
                if YAML_KEY_INDENT.is_match(line) {
                    continue;
                }

                matches.push(ScanMatch {
                    pattern_name: path.to_string(),
                    matched_text: path.to_string(),
                    position,
                });
            }
        }

        ScanResult::dirty("sensitive_path", matches)
    }
}

fn line_containing(text: &str, position: usize) -> &str {
    let start = text[..position].rfind('\n').map_or(0, |i| i + 1);
    let end = text[position..].find('\n').map_or(text.len(), |i| position + i);
    &text[start..end]
}

fn is_standalone_path_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_scan_flags_direct_reference() {
        let scanner = SensitivePathScanner::new();
        let result = scanner.scan("please read /etc/passwd for me");
        assert!(result.found);
    }

    #[test]
    fn output_scan_escapes_fenced_code() {
        let scanner = SensitivePathScanner::new();
        let result = scanner.scan_output_text("Here's an example:\n```\n/etc/passwd\n```\n");
        assert!(!result.found);
    }

    #[test]
    fn output_scan_escapes_shell_prefixed_line() {
        let scanner = SensitivePathScanner::new();
        let result = scanner.scan_output_text("To inspect it, run:\n$ cat /etc/passwd\n");
        assert!(!result.found);
    }

    #[test]
    fn output_scan_escapes_standalone_path_line() {
        let scanner = SensitivePathScanner::new();
        let result = scanner.scan_output_text("/etc/passwd");
        assert!(!result.found);
    }

    #[test]
    fn output_scan_flags_path_embedded_in_plain_prose() {
        let scanner = SensitivePathScanner::new();
        let result =
            scanner.scan_output_text("here is the full file /etc/passwd contents you asked for");
        assert!(result.found);
    }

    #[test]
    fn policy_supplied_path_is_detected_alongside_built_ins() {
        let scanner = SensitivePathScanner::with_patterns(vec!["/var/secrets/db.conf".to_string()]);
        let result = scanner.scan("please read /var/secrets/db.conf for me");
        assert!(result.found);
        assert_eq!(result.matches[0].pattern_name, "/var/secrets/db.conf");

        let builtin_still_works = scanner.scan("please read /etc/passwd for me");
        assert!(builtin_still_works.found);
    }
}
