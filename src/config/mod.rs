//! Policy document loading and validation.
//!
//! Structured directly on `wg-bastion::config::{SecurityPolicy,
//! PolicyBuilder}`: compiled-secure defaults, optional file load (YAML,
//! TOML, or JSON, dispatched on extension), optional environment-variable
//! overrides under this crate's `GWSEC_` prefix, and `validator`-derived
//! field constraints checked at `build()` time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::policy::{CommandPolicy, FileAccessPolicy};
use crate::scan::CredentialPatternEntry;

/// Errors that can occur while building a [`GatewayPolicy`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the policy document from disk.
    #[error("failed to read config file at {path}: {source}")]
    FileRead {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the policy document.
    #[error("failed to parse {format} config: {source}")]
    ParseError {
        /// Format that failed to parse (YAML, TOML, JSON).
        format: String,
        /// Underlying parse error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Unsupported or unrecognised configuration file extension.
    #[error("unsupported config file format: {message}")]
    UnsupportedFormat {
        /// Description of the problem.
        message: String,
    },

    /// Declarative field-constraint validation failed.
    #[error("policy validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// An environment-variable override failed to parse.
    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse {
        /// Environment variable key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Behaviour when a security check fails — kept for parity with the
/// teacher's compiled-secure-default convention even though this crate's
/// subsystems are currently always fail-closed; reserved for a future
/// `Open`/`LogOnly` mode at the orchestrator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Block the request and return an error.
    Closed,
    /// Allow the request but log the security event.
    Open,
    /// Log the event and continue (audit mode).
    LogOnly,
}

impl Default for FailMode {
    fn default() -> Self {
        Self::Closed
    }
}

/// The gateway's full policy document: file access, command allowlisting,
/// scanner pattern overrides, and the operational toggles spec.md §6 and §11
/// reference (approval/session timeouts, spotlighting, verbose diagnostics).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GatewayPolicy {
    /// Policy document version, for compatibility tracking.
    #[validate(length(min = 1))]
    pub version: String,

    /// Global enable/disable flag.
    pub enabled: bool,

    /// Default failure behaviour.
    pub fail_mode: FailMode,

    /// File-access glob rules and workspace root.
    pub file_access: FileAccessPolicy,

    /// Command allowlist and structural-block rules.
    pub commands: CommandPolicy,

    /// Additional named credential regexes layered on top of the built-in
    /// set, stored as raw pattern text per spec.md §6 ("patterns are stored
    /// as raw regex/glob text; the engine compiles them at startup and
    /// rejects the document if any entry fails to compile"). Wired into
    /// [`crate::scan::CredentialScanner::with_patterns`] via
    /// [`crate::pipeline::ScanPipeline::with_policy_patterns`].
    #[serde(default)]
    pub credential_patterns: Vec<CredentialPatternEntry>,

    /// Additional sensitive-path fragments layered on top of the built-in
    /// set. Wired into
    /// [`crate::scan::SensitivePathScanner::with_patterns`] via
    /// [`crate::pipeline::ScanPipeline::with_policy_patterns`].
    #[serde(default)]
    pub sensitive_path_patterns: Vec<String>,

    /// How long a pending approval record lives before expiring.
    #[validate(range(min = 1))]
    pub approval_timeout_secs: u64,

    /// How long an idle session lives before eviction.
    #[validate(range(min = 1))]
    pub session_ttl_secs: u64,

    /// Maximum number of concurrently tracked sessions before LRU eviction.
    #[validate(range(min = 1))]
    pub session_max_count: usize,

    /// Whether untrusted data is per-word spotlight-marked before being
    /// sent to the worker. When `false`, the `<UNTRUSTED_DATA>` tags and
    /// sandwich reminder are still applied — only the per-word marking is
    /// skipped, per spec.md §4.4 step 4.
    pub spotlighting_enabled: bool,

    /// Whether `StepResult`'s verbose-only fields (planner prompt, resolved
    /// prompt, raw worker response) are populated. Defaults `false`; the
    /// Rust equivalent of the original's `SENTINEL_VERBOSE_RESULTS` gate.
    pub verbose_diagnostics: bool,

    /// Whether the injection classifier is required to be available; if
    /// `true` and the configured classifier reports `Unavailable`, the
    /// scan pipeline fails closed per spec.md §4.4.
    pub injection_classifier_required: bool,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            enabled: true,
            fail_mode: FailMode::Closed,
            file_access: FileAccessPolicy {
                blocked_patterns: vec!["**/*.env".into(), "**/.git/**".into(), "**/.ssh/**".into()],
                read_allowed: vec!["/workspace/**".into(), "/workspace".into()],
                write_allowed: vec!["/workspace/**".into(), "/workspace".into()],
                workspace_root: PathBuf::from("/workspace"),
            },
            commands: CommandPolicy {
                allowed_commands: vec!["ls".into(), "cat".into(), "git".into()],
                path_constrained: vec!["cat".into()],
                blocked_patterns: vec![],
            },
            credential_patterns: Vec::new(),
            sensitive_path_patterns: Vec::new(),
            approval_timeout_secs: 300,
            session_ttl_secs: 3_600,
            session_max_count: 10_000,
            spotlighting_enabled: true,
            verbose_diagnostics: false,
            injection_classifier_required: false,
        }
    }
}

/// Builder for constructing a [`GatewayPolicy`] from compiled defaults, an
/// optional file, and optional environment overrides, following
/// `wg-bastion::config::PolicyBuilder`'s resolution order (file, then env;
/// later wins).
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    base: GatewayPolicy,
    use_env: bool,
}

impl PolicyBuilder {
    /// Create a new builder with secure compiled defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: GatewayPolicy::default(),
            use_env: false,
        }
    }

    /// Load the policy document from a file (YAML, TOML, or JSON,
    /// dispatched on extension).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let policy: GatewayPolicy = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
                    format: "YAML".to_string(),
                    source: Box::new(e),
                })?
            }
            Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                format: "TOML".to_string(),
                source: Box::new(e),
            })?,
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                    format: "JSON".to_string(),
                    source: Box::new(e),
                })?
            }
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    message: "file extension must be .yaml, .yml, .toml, or .json".to_string(),
                });
            }
        };

        self.base = policy;
        Ok(self)
    }

    /// Enable loading overrides from environment variables prefixed
    /// `GWSEC_` (e.g. `GWSEC_ENABLED=false`, `GWSEC_VERBOSE_DIAGNOSTICS=true`).
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Build and validate the final policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an environment override fails to parse or
    /// the resulting policy fails validation.
    pub fn build(mut self) -> Result<GatewayPolicy, ConfigError> {
        if self.use_env {
            dotenvy::dotenv().ok();

            if let Ok(v) = std::env::var("GWSEC_ENABLED") {
                self.base.enabled = parse_bool_env("GWSEC_ENABLED", &v)?;
            }
            if let Ok(v) = std::env::var("GWSEC_FAIL_MODE") {
                self.base.fail_mode = match v.to_lowercase().as_str() {
                    "closed" => FailMode::Closed,
                    "open" => FailMode::Open,
                    "log_only" | "logonly" => FailMode::LogOnly,
                    _ => {
                        return Err(ConfigError::EnvParse {
                            key: "GWSEC_FAIL_MODE".to_string(),
                            message: "must be 'closed', 'open', or 'log_only'".to_string(),
                        });
                    }
                };
            }
            if let Ok(v) = std::env::var("GWSEC_SPOTLIGHTING_ENABLED") {
                self.base.spotlighting_enabled = parse_bool_env("GWSEC_SPOTLIGHTING_ENABLED", &v)?;
            }
            if let Ok(v) = std::env::var("GWSEC_VERBOSE_DIAGNOSTICS") {
                self.base.verbose_diagnostics = parse_bool_env("GWSEC_VERBOSE_DIAGNOSTICS", &v)?;
            }
            if let Ok(v) = std::env::var("GWSEC_SESSION_TTL_SECS") {
                self.base.session_ttl_secs = v.parse().map_err(|_| ConfigError::EnvParse {
                    key: "GWSEC_SESSION_TTL_SECS".to_string(),
                    message: "must be a positive integer".to_string(),
                })?;
            }
            if let Ok(v) = std::env::var("GWSEC_APPROVAL_TIMEOUT_SECS") {
                self.base.approval_timeout_secs = v.parse().map_err(|_| ConfigError::EnvParse {
                    key: "GWSEC_APPROVAL_TIMEOUT_SECS".to_string(),
                    message: "must be a positive integer".to_string(),
                })?;
            }
        }

        self.base.validate()?;
        Ok(self.base)
    }
}

fn parse_bool_env(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse().map_err(|_| ConfigError::EnvParse {
        key: key.to_string(),
        message: "must be 'true' or 'false'".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_enabled_and_secure() {
        let policy = GatewayPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.fail_mode, FailMode::Closed);
        assert!(!policy.verbose_diagnostics);
    }

    #[test]
    fn builder_without_file_or_env_yields_defaults() {
        let policy = PolicyBuilder::new().build().unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.version, "1.0");
    }

    #[test]
    fn fail_mode_serializes_snake_case() {
        let json = serde_json::to_string(&FailMode::LogOnly).unwrap();
        assert_eq!(json, r#""log_only""#);
    }

    #[test]
    fn empty_version_fails_validation() {
        let mut policy = GatewayPolicy::default();
        policy.version = String::new();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn credential_patterns_round_trip_through_yaml() {
        let mut policy = GatewayPolicy::default();
        policy.credential_patterns.push(CredentialPatternEntry {
            name: "internal_token".to_string(),
            pattern: r"itok_[A-Za-z0-9]{16}".to_string(),
        });
        policy.sensitive_path_patterns.push("/var/secrets/db.conf".to_string());

        let yaml = serde_yaml::to_string(&policy).unwrap();
        let reloaded: GatewayPolicy = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(reloaded.credential_patterns.len(), 1);
        assert_eq!(reloaded.credential_patterns[0].name, "internal_token");
        assert_eq!(reloaded.sensitive_path_patterns, vec!["/var/secrets/db.conf".to_string()]);
    }
}
