//! Crate-wide structured error types.
//!
//! Every subsystem defines its own error enum; [`GatewayError`] aggregates
//! them via `#[from]` so callers at the orchestrator boundary can match on
//! a single type while subsystem code keeps precise, locally-meaningful
//! variants. This mirrors `wg-bastion::config::ConfigError`'s style rather
//! than a flat `anyhow`-style error.

use thiserror::Error;

use crate::conversation::ConversationError;
use crate::model::ScanResult;
use crate::policy::PolicyDecision;
use crate::provenance::ProvenanceError;

/// The kind of security boundary a [`GatewayError::SecurityViolation`] fired at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// `scan_input` reported a dirty result.
    Input,
    /// `scan_output` reported a dirty result.
    Output,
    /// The ASCII gate rejected a planner-constructed prompt.
    AsciiGate,
    /// The combined prompt + untrusted-data length gate fired.
    LengthGate,
    /// The vulnerability-echo scanner found a reproduced fingerprint.
    EchoScanner,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::AsciiGate => "ascii_gate",
            Self::LengthGate => "length_gate",
            Self::EchoScanner => "echo_scanner",
        };
        write!(f, "{s}")
    }
}

/// Top-level error type for the gateway core.
///
/// Spec taxonomy (see `SPEC_FULL.md` §7): every variant here is distinct and
/// carries the data an audit record needs. No variant wraps a bare `String`
/// where structured data is available.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A scanner blocked input or output, or the ASCII/length gate fired.
    /// Never recovered from — surfaced as a `blocked` task result.
    #[error("security violation ({kind}): {reason}")]
    SecurityViolation {
        /// Which boundary the violation occurred at.
        kind: ViolationKind,
        /// Human-readable summary (safe for end users — no secrets).
        reason: String,
        /// The scanner results that triggered the violation, keyed by scanner name.
        scan_results: std::collections::HashMap<String, ScanResult>,
        /// The worker's raw response, present only for post-worker violations.
        /// Never serialised into user-facing output; gated by verbose mode.
        raw_response: Option<String>,
    },

    /// The policy engine denied a file or command operation. Step-level.
    #[error("policy violation: {0:?}")]
    PolicyViolation(PolicyDecision),

    /// A tool failed at runtime (distinct from a policy denial).
    #[error("tool error executing '{tool}': {reason}")]
    ToolError {
        /// Tool name.
        tool: String,
        /// What went wrong.
        reason: String,
    },

    /// A tool invocation was denied by policy before execution.
    #[error("tool '{tool}' blocked by policy: {reason}")]
    ToolBlockedError {
        /// Tool name.
        tool: String,
        /// Policy denial reason.
        reason: String,
    },

    /// Storage-layer failure in the provenance store. Treated as fatal for
    /// the task — no further steps execute on partial state.
    #[error("provenance store error: {0}")]
    ProvenanceError(#[from] ProvenanceError),

    /// The session was previously locked; the request is rejected immediately.
    #[error("session '{session_id}' is locked")]
    SessionLocked {
        /// The locked session's id.
        session_id: String,
    },

    /// A deadline elapsed. Surfaced as step-level `Error`.
    #[error("operation '{operation}' timed out after {elapsed_ms}ms")]
    TimeoutError {
        /// What operation timed out (e.g. `"worker.generate"`).
        operation: String,
        /// Elapsed time before the deadline fired.
        elapsed_ms: u64,
    },

    /// The planner, worker, or sidecar refused or crashed.
    #[error("external dependency '{dependency}' unavailable: {reason}")]
    ExternalUnavailable {
        /// Which external collaborator failed.
        dependency: String,
        /// Failure detail.
        reason: String,
        /// Whether a caller may reasonably retry.
        retryable: bool,
    },

    /// An inbound request violated field constraints, before any scanning.
    #[error("validation error on field '{field}': {reason}")]
    ValidationError {
        /// Offending field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Multi-turn conversation analysis rejected the request outright.
    #[error("conversation analysis blocked the request: {0}")]
    ConversationBlocked(#[from] ConversationError),

    /// The task's cancellation token fired before `operation` completed.
    /// Surfaced as a step-level `Error`, never `Blocked` — cancellation is
    /// an operational outcome, not a security verdict.
    #[error("operation '{operation}' was cancelled")]
    Cancelled {
        /// What was in flight when cancellation fired (e.g. `"worker.generate"`).
        operation: String,
    },
}

impl GatewayError {
    /// Construct a [`GatewayError::SecurityViolation`] with no raw response
    /// attached (the common case for pre-worker violations).
    #[must_use]
    pub fn security_violation(
        kind: ViolationKind,
        reason: impl Into<String>,
        scan_results: std::collections::HashMap<String, ScanResult>,
    ) -> Self {
        Self::SecurityViolation {
            kind,
            reason: reason.into(),
            scan_results,
            raw_response: None,
        }
    }

    /// Returns `true` if this error represents a short-circuiting security
    /// violation (as opposed to a recoverable/step-level error).
    #[must_use]
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation { .. })
    }

    /// Returns `true` if this error represents a deliberate denial (a scan,
    /// policy, or conversation-analysis verdict) rather than an operational
    /// failure — the distinction the orchestrator uses to decide whether a
    /// failed step surfaces as `Blocked` or `Error`.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::SecurityViolation { .. }
                | Self::PolicyViolation(_)
                | Self::ToolBlockedError { .. }
                | Self::SessionLocked { .. }
                | Self::ConversationBlocked(_)
        )
    }
}
