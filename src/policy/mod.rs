//! Path containment, traversal detection, and command allowlisting.
//!
//! Ported line-for-line from `sentinel/security/policy_engine.py`: iterative
//! URL-decoding to catch encoded traversal markers, a small hand-rolled glob
//! matcher for file-access rules (no glob crate in the teacher's stack, and
//! the match semantics are narrow enough to hand-roll faithfully), and
//! structural + allowlist checks for shell commands.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Maximum number of iterative URL-decode rounds, ported verbatim from
/// `_url_decode_iterative`'s hard cap (catches double/triple encoding while
/// bounding worst-case work).
const MAX_URL_DECODE_ROUNDS: usize = 10;

/// The result of a policy check against a file or command operation.
///
/// Two-state contract per spec.md §4.2, enriched with an always-present
/// `resolved_path` — see `DESIGN.md`'s Open Question decision #2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    /// The operation is permitted.
    Allowed {
        /// The fully normalised, canonical path the operation resolved to.
        resolved_path: String,
    },
    /// The operation is denied.
    Blocked {
        /// Human-readable reason, safe to surface to the end user.
        reason: String,
        /// The path as resolved at the point the check failed (may be
        /// partially normalised if resolution itself failed).
        resolved_path: String,
    },
}

impl PolicyDecision {
    /// Returns `true` if this decision is [`PolicyDecision::Allowed`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// File-access policy: allow and block glob patterns, evaluated in the
/// original's fixed order (traversal detection, then blocked patterns, then
/// allow patterns, default-deny otherwise).
///
/// Read and write access are governed by distinct pattern sets — ported
/// from `policy_engine.py`'s `file_access.read_allowed` /
/// `file_access.write_allowed` (spec.md §4.2's `file_access.read_allowed` /
/// `write_allowed`) — so a policy document can, for example, allow reading a
/// template file while forbidding writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccessPolicy {
    /// Glob patterns that are always denied for both read and write,
    /// checked before either allow list.
    pub blocked_patterns: Vec<String>,
    /// Glob patterns permitted for reads.
    pub read_allowed: Vec<String>,
    /// Glob patterns permitted for writes.
    pub write_allowed: Vec<String>,
    /// Root directory all resolved paths are constrained to.
    pub workspace_root: PathBuf,
}

/// Command execution policy: an allowlist of base commands plus structural
/// injection checks that always apply regardless of allowlist membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPolicy {
    /// Base commands (e.g. `"git"`, `"podman build"`) that are permitted.
    pub allowed_commands: Vec<String>,
    /// Subset of `allowed_commands` whose positional (non-flag, non-glob)
    /// arguments must each satisfy `check_file_read`, per spec.md §4.2 step
    /// 6 — commands outside this subset are allowlisted but not otherwise
    /// argument-checked.
    #[serde(default)]
    pub path_constrained: Vec<String>,
    /// Substrings that reject a command outright, checked before allowlist
    /// lookup.
    pub blocked_patterns: Vec<String>,
}

/// Structural command-injection regexes, fixed and non-configurable —
/// ported verbatim from `policy_engine.py::_injection_patterns`.
static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\$\(",
        r"`",
        r";\s*",
        r"&&",
        r"\|\|",
        r"(?:^|[^|])\|(?:[^|]|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static injection pattern is valid regex"))
    .collect()
});

/// Evaluates [`FileAccessPolicy`] and [`CommandPolicy`] rules against
/// concrete operations.
pub struct PolicyEngine {
    file_access: FileAccessPolicy,
    commands: CommandPolicy,
}

impl PolicyEngine {
    /// Construct an engine from its policy documents.
    #[must_use]
    pub fn new(file_access: FileAccessPolicy, commands: CommandPolicy) -> Self {
        Self { file_access, commands }
    }

    /// Check whether `path` may be written, relative to the workspace root.
    #[must_use]
    pub fn check_file_write(&self, path: &str) -> PolicyDecision {
        self.check_file_access(path, &self.file_access.write_allowed)
    }

    /// Check whether `path` may be read, relative to the workspace root.
    #[must_use]
    pub fn check_file_read(&self, path: &str) -> PolicyDecision {
        self.check_file_access(path, &self.file_access.read_allowed)
    }

    fn check_file_access(&self, raw_path: &str, allowed_patterns: &[String]) -> PolicyDecision {
        let stripped = strip_null_bytes(raw_path);
        let decoded = url_decode_iterative(&stripped);

        if let Some(reason) = detect_traversal(&decoded) {
            return PolicyDecision::Blocked {
                reason,
                resolved_path: decoded,
            };
        }

        let normalised = normalise_path(&decoded, &self.file_access.workspace_root);

        for pattern in &self.file_access.blocked_patterns {
            if matches_any_glob(&normalised, pattern) {
                return PolicyDecision::Blocked {
                    reason: format!("path matches blocked pattern '{pattern}'"),
                    resolved_path: normalised,
                };
            }
        }

        for pattern in allowed_patterns {
            if matches_any_glob(&normalised, pattern) {
                return PolicyDecision::Allowed {
                    resolved_path: normalised,
                };
            }
        }

        PolicyDecision::Blocked {
            reason: "path does not match any allowed pattern".into(),
            resolved_path: normalised,
        }
    }

    /// Check whether `command` may be executed as given.
    #[must_use]
    pub fn check_command(&self, command: &str) -> PolicyDecision {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return PolicyDecision::Blocked {
                reason: "empty command".into(),
                resolved_path: String::new(),
            };
        }

        for pattern in INJECTION_PATTERNS.iter() {
            if pattern.is_match(trimmed) {
                return PolicyDecision::Blocked {
                    reason: "command contains shell metacharacters".into(),
                    resolved_path: trimmed.to_string(),
                };
            }
        }

        for pattern in &self.commands.blocked_patterns {
            if matches_any_glob(trimmed, pattern) {
                return PolicyDecision::Blocked {
                    reason: format!("command matches blocked pattern '{pattern}'"),
                    resolved_path: trimmed.to_string(),
                };
            }
        }

        let base = extract_base_command(trimmed, &self.commands.allowed_commands);
        match base {
            Some(matched) => {
                if self.commands.path_constrained.contains(&matched) {
                    if let Err(reason) = self.validate_command_arguments(trimmed) {
                        return PolicyDecision::Blocked {
                            reason,
                            resolved_path: trimmed.to_string(),
                        };
                    }
                }
                PolicyDecision::Allowed {
                    resolved_path: matched,
                }
            }
            None => PolicyDecision::Blocked {
                reason: "command is not in the allowlist".into(),
                resolved_path: trimmed.to_string(),
            },
        }
    }

    /// Validates that every positional (non-flag, non-quoted, non-glob)
    /// argument of a path-constrained command satisfies `check_file_read`,
    /// joining relative tokens onto the workspace root first — ported from
    /// spec.md §4.2 step 6.
    fn validate_command_arguments(&self, command: &str) -> Result<(), String> {
        for token in command.split_whitespace().skip(1) {
            if token.starts_with('-')
                || token.starts_with('\'')
                || token.starts_with('"')
                || token.contains(['*', '?', '['])
            {
                continue;
            }

            let candidate_path = if Path::new(token).is_absolute() {
                token.to_string()
            } else {
                self.file_access
                    .workspace_root
                    .join(token)
                    .to_string_lossy()
                    .into_owned()
            };

            if !self.check_file_read(&candidate_path).is_allowed() {
                return Err(format!("argument '{token}' is not an allowed path"));
            }
        }
        Ok(())
    }
}

fn strip_null_bytes(s: &str) -> String {
    s.chars().filter(|&c| c != '\0').collect()
}

/// Iteratively percent-decodes `s`, stopping early once a round makes no
/// further progress, capped at [`MAX_URL_DECODE_ROUNDS`] rounds — ported
/// from `_url_decode_iterative`.
fn url_decode_iterative(s: &str) -> String {
    let mut current = s.to_string();
    for _ in 0..MAX_URL_DECODE_ROUNDS {
        let decoded = percent_decode_once(&current);
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn percent_decode_once(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Detects literal and encoded path traversal markers, ported from
/// `_detect_traversal`.
fn detect_traversal(decoded: &str) -> Option<String> {
    if decoded.contains("..") {
        return Some("path contains traversal sequence '..'".into());
    }
    if decoded.contains('\0') {
        return Some("path contains null byte".into());
    }
    let lower = decoded.to_lowercase();
    if lower.contains("%2e%2e") || lower.contains("%252e") {
        return Some("path contains encoded traversal marker".into());
    }
    None
}

/// Lexically normalises `path` against `root`, falling back to a
/// best-effort join if filesystem resolution is unavailable (e.g. the path
/// does not yet exist) — ported from `_normalise_path`'s
/// resolve-with-fallback behaviour.
fn normalise_path(path: &str, root: &Path) -> String {
    let candidate = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        root.join(path)
    };

    let mut normalised = PathBuf::new();
    for component in candidate.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                normalised.pop();
            }
            Component::CurDir => {}
            other => normalised.push(other.as_os_str()),
        }
    }

    std::fs::canonicalize(&normalised)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| normalised.to_string_lossy().into_owned())
}

/// Hand-rolled glob matcher covering `**`, `*`, and literal segments —
/// ported from `_matches_any_glob`'s `fnmatch`-based behaviour, including
/// the rule that `/workspace` itself matches a pattern of `/workspace/**`
/// and that `**/*.env` matches `.env` files at any depth.
fn matches_any_glob(path: &str, pattern: &str) -> bool {
    let path_norm = path.trim_end_matches('/');
    let pattern_norm = pattern.trim_end_matches('/');

    if let Some(prefix) = pattern_norm.strip_suffix("/**") {
        if path_norm == prefix || path_norm.starts_with(&format!("{prefix}/")) {
            return true;
        }
    }

    glob_match(pattern_norm, path_norm)
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t)
}

fn glob_match_inner(pattern: &[char], text: &[char]) -> bool {
    if pattern.is_empty() {
        return text.is_empty();
    }

    match pattern[0] {
        '*' => {
            if pattern.len() >= 2 && pattern[1] == '*' {
                let rest = &pattern[2..];
                let rest = if rest.first() == Some(&'/') { &rest[1..] } else { rest };
                if glob_match_inner(rest, text) {
                    return true;
                }
                if !text.is_empty() {
                    return glob_match_inner(pattern, &text[1..]);
                }
                false
            } else {
                let rest = &pattern[1..];
                if glob_match_inner(rest, text) {
                    return true;
                }
                if !text.is_empty() && text[0] != '/' {
                    return glob_match_inner(pattern, &text[1..]);
                }
                false
            }
        }
        '?' => {
            if text.is_empty() || text[0] == '/' {
                false
            } else {
                glob_match_inner(&pattern[1..], &text[1..])
            }
        }
        c => {
            if text.first() == Some(&c) {
                glob_match_inner(&pattern[1..], &text[1..])
            } else {
                false
            }
        }
    }
}

/// Extracts a command's base, trying the first two whitespace-separated
/// tokens before falling back to just the first — ported from
/// `_extract_base_command` (handles multi-word allowlist entries like
/// `"podman build"`).
fn extract_base_command(command: &str, allowed: &[String]) -> Option<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens.len() >= 2 {
        let two_word = format!("{} {}", tokens[0], tokens[1]);
        if allowed.iter().any(|a| a == &two_word) {
            return Some(two_word);
        }
    }
    if let Some(first) = tokens.first() {
        if allowed.iter().any(|a| a == first) {
            return Some((*first).to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            FileAccessPolicy {
                blocked_patterns: vec!["**/*.env".into(), "**/.git/**".into()],
                read_allowed: vec!["/workspace/**".into(), "/workspace".into()],
                write_allowed: vec!["/workspace/**".into(), "/workspace".into()],
                workspace_root: PathBuf::from("/workspace"),
            },
            CommandPolicy {
                allowed_commands: vec!["git".into(), "podman build".into(), "ls".into(), "cat".into()],
                path_constrained: vec!["cat".into()],
                blocked_patterns: vec![],
            },
        )
    }

    #[test]
    fn traversal_is_blocked() {
        let decision = engine().check_file_read("/workspace/../etc/passwd");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn encoded_traversal_is_blocked() {
        let decision = engine().check_file_read("/workspace/%2e%2e/etc/passwd");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn double_encoded_traversal_is_blocked() {
        let decision = engine().check_file_read("/workspace/%252e%252e/etc/passwd");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn env_file_blocked_at_any_depth() {
        let decision = engine().check_file_read("/workspace/deep/nested/dir/secrets.env");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn workspace_directory_itself_is_allowed() {
        let decision = engine().check_file_read("/workspace");
        assert!(decision.is_allowed());
    }

    #[test]
    fn file_inside_workspace_is_allowed() {
        let decision = engine().check_file_write("/workspace/notes.txt");
        assert!(decision.is_allowed());
    }

    #[test]
    fn read_and_write_allow_lists_are_independent() {
        let engine = PolicyEngine::new(
            FileAccessPolicy {
                blocked_patterns: vec![],
                read_allowed: vec!["/workspace/templates/**".into()],
                write_allowed: vec!["/workspace/output/**".into()],
                workspace_root: PathBuf::from("/workspace"),
            },
            CommandPolicy {
                allowed_commands: vec![],
                path_constrained: vec![],
                blocked_patterns: vec![],
            },
        );

        // Readable template, not writable.
        assert!(engine.check_file_read("/workspace/templates/report.md").is_allowed());
        assert!(!engine.check_file_write("/workspace/templates/report.md").is_allowed());

        // Writable output directory, not readable.
        assert!(engine.check_file_write("/workspace/output/result.txt").is_allowed());
        assert!(!engine.check_file_read("/workspace/output/result.txt").is_allowed());
    }

    #[test]
    fn command_with_semicolon_is_blocked() {
        let decision = engine().check_command("ls; rm -rf /");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn command_with_pipe_to_shell_is_blocked() {
        let decision = engine().check_command("ls | sh");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn two_word_allowlist_entry_matches() {
        let decision = engine().check_command("podman build -t foo .");
        assert!(decision.is_allowed());
    }

    #[test]
    fn unknown_command_is_blocked() {
        let decision = engine().check_command("curl http://evil.example");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn empty_command_is_blocked() {
        let decision = engine().check_command("   ");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn path_constrained_command_blocks_traversal_argument() {
        let decision = engine().check_command("cat ../../../etc/passwd");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn path_constrained_command_allows_workspace_argument() {
        let decision = engine().check_command("cat notes.txt");
        assert!(decision.is_allowed());
    }

    #[test]
    fn path_constrained_command_discards_flag_arguments() {
        let decision = engine().check_command("cat -n notes.txt");
        assert!(decision.is_allowed());
    }

    #[test]
    fn unconstrained_command_skips_argument_path_check() {
        // `git` is allowlisted but not path-constrained: an argument that
        // would fail check_file_read does not block the command.
        let decision = engine().check_command("git clone /etc/passwd");
        assert!(decision.is_allowed());
    }
}
