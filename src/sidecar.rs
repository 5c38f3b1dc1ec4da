//! Wire protocol for the WASM tool sidecar.
//!
//! The sidecar itself — a separate process that executes WASM-sandboxed
//! tools and speaks newline-delimited JSON over a Unix domain socket — is
//! explicitly out of scope here (see `SPEC_FULL.md` §6's Non-goal). This
//! module carries only the request/response shapes and the client contract
//! [`crate::tool_executor::ToolExecutor`] dispatches through, ported from
//! `sentinel/tools/sidecar.py`'s `SidecarResponse` dataclass and the request
//! dict `execute()` builds.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request sent to the sidecar for one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarRequest {
    /// Correlates a request with its response; the sidecar echoes it back.
    pub request_id: String,
    /// Name of the WASM-sandboxed tool to invoke.
    pub tool_name: String,
    /// Tool arguments, as a JSON object.
    pub args: HashMap<String, serde_json::Value>,
    /// Capability grants for this invocation (e.g. `"fs:read"`, `"net:fetch"`).
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Credential material to make available inside the sandbox, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<HashMap<String, String>>,
    /// Per-call timeout override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Allowed outbound hosts for tools that perform network access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_allowlist: Option<Vec<String>>,
}

/// The sidecar's response to one [`SidecarRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarResponse {
    /// Whether the tool invocation succeeded.
    pub success: bool,
    /// Human-readable result text.
    pub result: String,
    /// Structured result payload, if the tool produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Whether the sandbox detected the tool attempting to leak a credential
    /// it was granted but not authorised to exfiltrate.
    #[serde(default)]
    pub leaked: bool,
    /// WASM fuel consumed by the invocation, if the runtime tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_consumed: Option<u64>,
}

impl SidecarResponse {
    /// Build a failure response with the given message and no other fields
    /// set — the shape `sidecar.py` returns on timeout or connection failure.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: message.into(),
            data: None,
            leaked: false,
            fuel_consumed: None,
        }
    }
}

/// Tools dispatched to the sidecar rather than executed in-process, ported
/// verbatim from `sentinel/tools/executor.py::WASM_TOOLS`.
pub const WASM_TOOLS: &[&str] = &["file_read", "file_write", "shell_exec", "http_fetch"];

/// Client contract for talking to the sidecar. The actual Unix-socket
/// connection lifecycle (dial, reconnect-on-failure, newline-delimited JSON
/// framing) belongs to a concrete implementation outside this crate's scope;
/// callers inject one at construction time.
#[async_trait]
pub trait SidecarClient: Send + Sync {
    /// Send `request` to the sidecar and await its response, or a
    /// [`SidecarResponse::failure`] if the sidecar is unreachable or the
    /// call times out.
    async fn execute(&self, request: SidecarRequest) -> SidecarResponse;
}
