//! Policy-gated tool dispatch.
//!
//! Ported from `sentinel/tools/executor.py`: every tool call is checked
//! against the [`crate::policy::PolicyEngine`] before it runs, WASM-eligible
//! tools are handed off to a sidecar when one is configured, and every
//! result is tagged and recorded in the provenance store — with `file_read`
//! inheriting the writer's trust level when the file was produced earlier in
//! the same run, which is what prevents an untrusted write from being
//! laundered back to trusted just by passing through disk.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::model::{DataSource, TaggedData, TrustLevel};
use crate::policy::PolicyEngine;
use crate::provenance::ProvenanceStore;
use crate::sidecar::{SidecarClient, SidecarRequest, WASM_TOOLS};

/// Podman flags that must never be passed, even if the tool interface is
/// extended later — ported verbatim from `_DANGEROUS_PODMAN_FLAG_NAMES`.
const DANGEROUS_PODMAN_FLAG_NAMES: &[&str] = &[
    "-v", "--volume", "-p", "--publish", "--privileged", "--cap-add", "--security-opt", "--device",
];

/// Podman `flag=value` pairs that must never be passed — ported verbatim
/// from `_DANGEROUS_PODMAN_FLAG_VALUES`.
const DANGEROUS_PODMAN_FLAG_VALUES: &[&str] =
    &["--pid=host", "--network=host", "--userns=host", "--ipc=host"];

/// Required sidecar capabilities per WASM-eligible tool, ported from
/// `_WASM_TOOL_CAPABILITIES`.
fn wasm_capabilities(tool_name: &str) -> Vec<String> {
    match tool_name {
        "file_read" => vec!["read_file".to_string()],
        "file_write" => vec!["write_file".to_string()],
        "shell_exec" => vec!["shell_exec".to_string()],
        "http_fetch" => vec!["http_request".to_string()],
        _ => Vec::new(),
    }
}

/// A tool's name, description, and argument schema, for planner consumption.
#[derive(Debug, Clone)]
pub struct ToolDescription {
    /// Tool name, as passed to [`ToolExecutor::execute`].
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Argument names to their expected shape (`"string"` for every current
    /// tool; kept as a string rather than an enum since the original's
    /// schema is itself just descriptive text for the planner prompt).
    pub args: &'static [(&'static str, &'static str)],
}

/// Static catalogue of every tool this executor dispatches, ported verbatim
/// from `get_tool_descriptions`.
pub const TOOL_DESCRIPTIONS: &[ToolDescription] = &[
    ToolDescription {
        name: "file_write",
        description: "Write content to a file at the given path",
        args: &[("path", "string"), ("content", "string")],
    },
    ToolDescription {
        name: "file_read",
        description: "Read the contents of a file",
        args: &[("path", "string")],
    },
    ToolDescription {
        name: "mkdir",
        description: "Create a directory (and parents)",
        args: &[("path", "string")],
    },
    ToolDescription {
        name: "shell",
        description: "Run a shell command and return its output",
        args: &[("command", "string")],
    },
    ToolDescription {
        name: "podman_build",
        description: "Build a container image from a context directory",
        args: &[("context_path", "string"), ("tag", "string")],
    },
    ToolDescription {
        name: "podman_run",
        description: "Run a container from an image",
        args: &[("image", "string"), ("name", "string")],
    },
    ToolDescription {
        name: "podman_stop",
        description: "Stop a running container",
        args: &[("container_name", "string")],
    },
];

fn arg_str<'a>(args: &'a HashMap<String, serde_json::Value>, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

/// Executes tool actions with policy validation before every operation.
pub struct ToolExecutor {
    policy: Arc<PolicyEngine>,
    provenance: Arc<dyn ProvenanceStore>,
    sidecar: Option<Arc<dyn SidecarClient>>,
}

impl ToolExecutor {
    /// Construct an executor with no sidecar configured; every tool runs
    /// in-process.
    #[must_use]
    pub fn new(policy: Arc<PolicyEngine>, provenance: Arc<dyn ProvenanceStore>) -> Self {
        Self {
            policy,
            provenance,
            sidecar: None,
        }
    }

    /// Attach a sidecar client (builder-style); `file_read`, `file_write`,
    /// `shell_exec`, and `http_fetch` will be dispatched to it.
    #[must_use]
    pub fn with_sidecar(mut self, sidecar: Arc<dyn SidecarClient>) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    /// The static tool catalogue, for planner prompt construction.
    #[must_use]
    pub fn tool_descriptions(&self) -> &'static [ToolDescription] {
        TOOL_DESCRIPTIONS
    }

    fn check_podman_flags(cmd: &[String]) -> Result<(), GatewayError> {
        for arg in cmd {
            let flag_name = arg.split_once('=').map_or(arg.as_str(), |(name, _)| name);
            if DANGEROUS_PODMAN_FLAG_NAMES.contains(&flag_name) || DANGEROUS_PODMAN_FLAG_VALUES.contains(&arg.as_str()) {
                warn!(event = "podman_flag_blocked", flag = %arg, cmd = %cmd.join(" "), "dangerous podman flag blocked");
                return Err(GatewayError::ToolBlockedError {
                    tool: "podman".to_string(),
                    reason: format!("dangerous podman flag blocked: {arg}"),
                });
            }
        }
        Ok(())
    }

    /// Dispatch one tool call by name.
    ///
    /// `derived_from` names the data ids of any previously-produced values
    /// substituted into `args` (e.g. a `$var` reference to an earlier step's
    /// output) — threaded into `file_write`'s provenance record so writing
    /// untrusted worker content to disk doesn't launder it back to `Trusted`
    /// (spec.md §8's S2 scenario, "trust laundering prevented"). Tools that
    /// don't write trust-bearing content ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ToolBlockedError`] if the policy engine or the
    /// podman flag check denies the operation, [`GatewayError::ToolError`] if
    /// the tool runs but fails, and [`GatewayError::ProvenanceError`] if
    /// tagging the result fails.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: HashMap<String, serde_json::Value>,
        derived_from: Vec<String>,
    ) -> Result<TaggedData, GatewayError> {
        info!(event = "tool_execute", tool = tool_name, "tool execution requested");

        if let Some(sidecar) = &self.sidecar {
            if WASM_TOOLS.contains(&tool_name) {
                return self.execute_via_sidecar(sidecar.as_ref(), tool_name, args, derived_from).await;
            }
        }

        match tool_name {
            "file_write" => self.file_write(&args, derived_from).await,
            "file_read" => self.file_read(&args).await,
            "mkdir" => self.mkdir(&args).await,
            "shell" => self.shell(&args).await,
            "podman_build" => self.podman_build(&args).await,
            "podman_run" => self.podman_run(&args).await,
            "podman_stop" => self.podman_stop(&args).await,
            other => {
                warn!(event = "tool_unknown", tool = other, "unknown tool requested");
                Err(GatewayError::ToolError {
                    tool: other.to_string(),
                    reason: "unknown tool".to_string(),
                })
            }
        }
    }

    async fn execute_via_sidecar(
        &self,
        sidecar: &dyn SidecarClient,
        tool_name: &str,
        args: HashMap<String, serde_json::Value>,
        derived_from: Vec<String>,
    ) -> Result<TaggedData, GatewayError> {
        let request = SidecarRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            args,
            capabilities: wasm_capabilities(tool_name),
            credentials: None,
            timeout_ms: None,
            http_allowlist: None,
        };

        let response = sidecar.execute(request).await;
        if !response.success {
            warn!(event = "sidecar_tool_failed", tool = tool_name, error = %response.result, "sidecar tool execution failed");
            return Err(GatewayError::ToolError {
                tool: tool_name.to_string(),
                reason: format!("sidecar: {}", response.result),
            });
        }
        if response.leaked {
            warn!(event = "sidecar_leak_detected", tool = tool_name, "sidecar detected credential leak in output");
        }

        let content = match &response.data {
            Some(data) => serde_json::to_string(data).unwrap_or_else(|_| response.result.clone()),
            None => response.result.clone(),
        };

        let tagged = self
            .provenance
            .create(content, TrustLevel::Trusted, DataSource::Tool, format!("sidecar:{tool_name}"), derived_from)
            .await?;
        info!(event = "sidecar_tool_complete", tool = tool_name, data_id = %tagged.id, leaked = response.leaked, "sidecar tool execution complete");
        Ok(tagged)
    }

    async fn file_write(
        &self,
        args: &HashMap<String, serde_json::Value>,
        derived_from: Vec<String>,
    ) -> Result<TaggedData, GatewayError> {
        let path = arg_str(args, "path");
        let content = arg_str(args, "content");

        let decision = self.policy.check_file_write(path);
        if !decision.is_allowed() {
            return Err(policy_blocked("file_write", &decision));
        }

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| tool_io_error("file_write", &e))?;
            }
        }
        tokio::fs::write(path, content).await.map_err(|e| tool_io_error("file_write", &e))?;

        info!(event = "file_written", path, size = content.len(), "file written");
        let tagged = self
            .provenance
            .create(
                format!("File written: {path}"),
                TrustLevel::Trusted,
                DataSource::Tool,
                format!("file_write:{path}"),
                derived_from,
            )
            .await?;
        self.provenance.record_file_write(path.to_string(), tagged.id.clone()).await;
        Ok(tagged)
    }

    async fn file_read(&self, args: &HashMap<String, serde_json::Value>) -> Result<TaggedData, GatewayError> {
        let path = arg_str(args, "path");

        let decision = self.policy.check_file_read(path);
        if !decision.is_allowed() {
            return Err(policy_blocked("file_read", &decision));
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| tool_io_error("file_read", &e))?;

        let mut trust_level = TrustLevel::Trusted;
        let mut parent_ids = Vec::new();
        if let Some(writer_id) = self.provenance.get_file_writer(path).await {
            if let Ok(writer_data) = self.provenance.get(&writer_id).await {
                if writer_data.trust_level == TrustLevel::Untrusted {
                    trust_level = TrustLevel::Untrusted;
                }
            }
            parent_ids.push(writer_id);
        }

        info!(event = "file_read_success", path, size = content.len(), trust_level = ?trust_level, "file read");
        Ok(self
            .provenance
            .create(content, trust_level, DataSource::File, format!("file_read:{path}"), parent_ids)
            .await?)
    }

    async fn mkdir(&self, args: &HashMap<String, serde_json::Value>) -> Result<TaggedData, GatewayError> {
        let path = arg_str(args, "path");

        let decision = self.policy.check_file_write(path);
        if !decision.is_allowed() {
            return Err(policy_blocked("mkdir", &decision));
        }

        tokio::fs::create_dir_all(path).await.map_err(|e| tool_io_error("mkdir", &e))?;
        info!(event = "mkdir_success", path, "directory created");
        Ok(self
            .provenance
            .create(
                format!("Directory created: {path}"),
                TrustLevel::Trusted,
                DataSource::Tool,
                format!("mkdir:{path}"),
                Vec::new(),
            )
            .await?)
    }

    async fn run_command(
        &self,
        tool: &str,
        cmd: &[String],
        timeout: Duration,
        originated_from: String,
    ) -> Result<TaggedData, GatewayError> {
        let joined = cmd.join(" ");
        let decision = self.policy.check_command(&joined);
        if !decision.is_allowed() {
            return Err(policy_blocked(tool, &decision));
        }

        let output = tokio::time::timeout(timeout, Command::new(&cmd[0]).args(&cmd[1..]).output())
            .await
            .map_err(|_| GatewayError::TimeoutError {
                operation: tool.to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| tool_io_error(tool, &e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            text.push_str(&format!("\n[exit code: {code}]\n{stderr}"));
            warn!(event = format!("{tool}_nonzero"), command = %joined, exit_code = code, "command exited non-zero");
        }

        Ok(self
            .provenance
            .create(text, TrustLevel::Trusted, DataSource::Tool, originated_from, Vec::new())
            .await?)
    }

    async fn shell(&self, args: &HashMap<String, serde_json::Value>) -> Result<TaggedData, GatewayError> {
        let command = arg_str(args, "command");
        let tokens = split_shell_words(command);
        if tokens.is_empty() {
            return Err(GatewayError::ToolBlockedError {
                tool: "shell".to_string(),
                reason: "empty command".to_string(),
            });
        }
        self.run_command("shell", &tokens, Duration::from_secs(30), format!("shell:{command}")).await
    }

    async fn podman_build(&self, args: &HashMap<String, serde_json::Value>) -> Result<TaggedData, GatewayError> {
        let context_path = arg_str(args, "context_path");
        let tag = arg_str(args, "tag");
        let cmd: Vec<String> = vec![
            "podman".to_string(),
            "build".to_string(),
            context_path.to_string(),
            "-t".to_string(),
            tag.to_string(),
        ];
        Self::check_podman_flags(&cmd)?;
        self.run_command("podman_build", &cmd, Duration::from_secs(300), format!("podman_build:{tag}")).await
    }

    async fn podman_run(&self, args: &HashMap<String, serde_json::Value>) -> Result<TaggedData, GatewayError> {
        let image = arg_str(args, "image");
        let name = arg_str(args, "name");
        let cmd: Vec<String> = vec![
            "podman".to_string(),
            "run".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-d".to_string(),
            image.to_string(),
        ];
        Self::check_podman_flags(&cmd)?;
        self.run_command("podman_run", &cmd, Duration::from_secs(60), format!("podman_run:{image}")).await
    }

    async fn podman_stop(&self, args: &HashMap<String, serde_json::Value>) -> Result<TaggedData, GatewayError> {
        let container_name = arg_str(args, "container_name");
        let cmd: Vec<String> = vec!["podman".to_string(), "stop".to_string(), container_name.to_string()];
        Self::check_podman_flags(&cmd)?;
        self.run_command("podman_stop", &cmd, Duration::from_secs(30), format!("podman_stop:{container_name}")).await
    }
}

fn policy_blocked(tool: &str, decision: &crate::policy::PolicyDecision) -> GatewayError {
    let reason = match decision {
        crate::policy::PolicyDecision::Blocked { reason, .. } => reason.clone(),
        crate::policy::PolicyDecision::Allowed { .. } => unreachable!("policy_blocked called on an allowed decision"),
    };
    warn!(event = format!("{tool}_blocked"), reason = %reason, "tool blocked by policy");
    GatewayError::ToolBlockedError {
        tool: tool.to_string(),
        reason,
    }
}

fn tool_io_error(tool: &str, error: &std::io::Error) -> GatewayError {
    GatewayError::ToolError {
        tool: tool.to_string(),
        reason: error.to_string(),
    }
}

/// POSIX-ish whitespace/quote-aware tokeniser, standing in for `shlex.split`
/// since the command string reaching this handler has already passed
/// `PolicyEngine::check_command`'s structural checks — this only needs to
/// split a known-safe string into argv, not defend against adversarial input.
fn split_shell_words(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token || quote.is_some() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{CommandPolicy, FileAccessPolicy};
    use crate::provenance::InMemoryProvenanceStore;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn executor(workspace: PathBuf) -> ToolExecutor {
        let policy = Arc::new(PolicyEngine::new(
            FileAccessPolicy {
                blocked_patterns: vec!["**/*.env".into()],
                read_allowed: vec![format!("{}/**", workspace.display()), workspace.display().to_string()],
                write_allowed: vec![format!("{}/**", workspace.display()), workspace.display().to_string()],
                workspace_root: workspace,
            },
            CommandPolicy {
                allowed_commands: vec!["echo".into()],
                path_constrained: vec![],
                blocked_patterns: vec![],
            },
        ));
        ToolExecutor::new(policy, Arc::new(InMemoryProvenanceStore::new()))
    }

    #[tokio::test]
    async fn file_write_then_read_round_trips_and_inherits_trust() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path().to_path_buf());
        let file_path = dir.path().join("out.txt");

        let write_args = HashMap::from([
            ("path".to_string(), serde_json::json!(file_path.to_str().unwrap())),
            ("content".to_string(), serde_json::json!("hello world")),
        ]);
        let write_result = executor.execute("file_write", write_args, Vec::new()).await.unwrap();
        assert_eq!(write_result.trust_level, TrustLevel::Trusted);

        let read_args = HashMap::from([("path".to_string(), serde_json::json!(file_path.to_str().unwrap()))]);
        let read_result = executor.execute("file_read", read_args, Vec::new()).await.unwrap();
        assert_eq!(read_result.content, "hello world");
        assert_eq!(read_result.trust_level, TrustLevel::Trusted);
    }

    #[tokio::test]
    async fn file_write_inherits_untrusted_trust_from_derived_from_parent() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path().to_path_buf());
        let file_path = dir.path().join("out.txt");

        let untrusted_source = executor
            .provenance
            .create(
                "worker output".to_string(),
                TrustLevel::Untrusted,
                DataSource::Worker,
                "worker:step1".to_string(),
                Vec::new(),
            )
            .await
            .unwrap();

        let write_args = HashMap::from([
            ("path".to_string(), serde_json::json!(file_path.to_str().unwrap())),
            ("content".to_string(), serde_json::json!("worker output")),
        ]);
        let write_result = executor
            .execute("file_write", write_args, vec![untrusted_source.id])
            .await
            .unwrap();
        assert_eq!(write_result.trust_level, TrustLevel::Untrusted);

        let read_args = HashMap::from([("path".to_string(), serde_json::json!(file_path.to_str().unwrap()))]);
        let read_result = executor.execute("file_read", read_args, Vec::new()).await.unwrap();
        assert_eq!(read_result.trust_level, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn file_write_blocked_outside_workspace_is_not_read_back() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path().to_path_buf());
        let args = HashMap::from([
            ("path".to_string(), serde_json::json!("/etc/passwd")),
            ("content".to_string(), serde_json::json!("pwned")),
        ]);
        let result = executor.execute("file_write", args, Vec::new()).await;
        assert!(matches!(result, Err(GatewayError::ToolBlockedError { .. })));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path().to_path_buf());
        let result = executor.execute("teleport", HashMap::new(), Vec::new()).await;
        assert!(matches!(result, Err(GatewayError::ToolError { .. })));
    }

    #[tokio::test]
    async fn podman_run_with_network_host_is_blocked() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path().to_path_buf());
        let args = HashMap::from([
            ("image".to_string(), serde_json::json!("alpine")),
            ("name".to_string(), serde_json::json!("net=host")),
        ]);
        // simulate a dangerous flag slipping in via the name field by calling podman_run directly
        let cmd = vec!["podman".to_string(), "run".to_string(), "--network=host".to_string(), "alpine".to_string()];
        assert!(ToolExecutor::check_podman_flags(&cmd).is_err());
        let _ = executor.execute("podman_run", args, Vec::new()).await;
    }
}
