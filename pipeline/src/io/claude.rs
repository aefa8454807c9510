//! [`Gateway`] backed by the `claude` CLI in print mode.
//!
//! The CLI runs with `--output-format stream-json`, so stdout is one JSON event
//! per line. The final `result` event carries the structured payload, the
//! session id, and the turn count. Assistant events carry the tool calls that
//! [`crate::io::gateway::audit_tool_uses`] checks against the grant.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::SessionId;
use crate::core::types::StageName;
use crate::error::PipelineError;
use crate::io::gateway::{Gateway, GatewayReply, GatewayRequest, ToolUse};
use crate::io::process::{CommandOutput, LineObserver, run_command_with_stream};

/// CLI tool names that implement each capability.
pub fn tools_for(capability: Capability) -> &'static [&'static str] {
    match capability {
        Capability::ReadFile => &["Read"],
        Capability::WriteFile => &["Write"],
        Capability::EditFile => &["Edit", "MultiEdit", "NotebookEdit"],
        Capability::RunShell => &["Bash"],
        Capability::SearchContents => &["Grep"],
        Capability::ListFiles => &["Glob", "LS"],
    }
}

/// Reverse of [`tools_for`]. Tools outside the capability model map to `None`.
pub fn capability_for_tool(name: &str) -> Option<Capability> {
    Capability::ALL
        .into_iter()
        .find(|cap| tools_for(*cap).contains(&name))
}

/// Tools the CLI must never use outside the capability model.
const ALWAYS_DISALLOWED: &[&str] = &["Task", "WebFetch", "WebSearch", "TodoWrite"];

fn allowed_tools(grant: CapabilitySet) -> Vec<&'static str> {
    grant.iter().flat_map(|cap| tools_for(cap).iter().copied()).collect()
}

fn disallowed_tools(grant: CapabilitySet) -> Vec<&'static str> {
    grant
        .complement()
        .flat_map(|cap| tools_for(cap).iter().copied())
        .chain(ALWAYS_DISALLOWED.iter().copied())
        .collect()
}

/// Gateway that spawns the `claude` binary once per call.
#[derive(Debug, Clone)]
pub struct ClaudeCliGateway {
    binary: String,
}

impl ClaudeCliGateway {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, request: &GatewayRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&request.model)
            .arg("--max-turns")
            .arg(request.max_turns.to_string())
            .arg("--json-schema")
            .arg(&request.result_schema);

        let allowed = allowed_tools(request.capabilities);
        if !allowed.is_empty() {
            cmd.arg("--allowedTools").arg(allowed.join(","));
        }
        cmd.arg("--disallowedTools")
            .arg(disallowed_tools(request.capabilities).join(","));

        if let Some(system_prompt) = &request.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if let Some(session) = &request.resume {
            cmd.arg("--resume").arg(session.as_str());
        }
        // The CLI has no working-directory flag.
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl Default for ClaudeCliGateway {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl Gateway for ClaudeCliGateway {
    #[instrument(skip_all, fields(stage = %request.stage, model = %request.model, timeout_secs = request.timeout.as_secs(), resume = request.resume.is_some()))]
    fn invoke(&self, request: &GatewayRequest) -> Result<GatewayReply, PipelineError> {
        let stage = request.stage;
        if request.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        info!(workdir = %request.workdir.display(), "starting claude");

        // Events are digested as they arrive; the captured stdout is only a bounded log.
        let digest = Arc::new(Mutex::new(StreamDigest::default()));
        let observer: LineObserver = {
            let digest = Arc::clone(&digest);
            Box::new(move |line: &[u8]| {
                if let Ok(mut digest) = digest.lock() {
                    digest.observe(&String::from_utf8_lossy(line));
                }
            })
        };

        let output = run_command_with_stream(
            self.command(request),
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.stream_path.as_deref(),
            Some(observer),
            &request.cancel,
        )
        .map_err(|err| PipelineError::GatewayTransport {
            stage,
            message: format!("{err:#}"),
        })?;

        if let Some(log_path) = &request.log_path {
            write_gateway_log(log_path, &output, request.output_limit_bytes)?;
        }

        if output.cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        if output.timed_out() {
            warn!(timeout_secs = request.timeout.as_secs(), "claude timed out");
            return Err(PipelineError::GatewayTimeout {
                stage,
                timeout: request.timeout,
            });
        }

        let digest = match digest.lock() {
            Ok(mut digest) => std::mem::take(&mut *digest),
            Err(_) => {
                return Err(PipelineError::Internal(anyhow::anyhow!(
                    "stream digest lock poisoned"
                )));
            }
        };
        if output.stdout_truncated > 0 {
            debug!(
                truncated = output.stdout_truncated,
                "stdout capture truncated, reply taken from the full stream"
            );
        }
        let parsed = digest.finish(stage, request.max_turns);
        if parsed.is_err() && !output.status.success() {
            warn!(exit_code = ?output.status.code(), "claude failed");
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::GatewayTransport {
                stage,
                message: format!(
                    "claude exited with status {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }
        let reply = parsed?;
        debug!(session = ?reply.session_id, turns = ?reply.turns, "claude completed");
        Ok(reply)
    }
}

/// Parse a `stream-json` transcript into a [`GatewayReply`].
pub fn parse_stream(
    stage: StageName,
    stdout: &str,
    max_turns: u32,
) -> Result<GatewayReply, PipelineError> {
    let mut digest = StreamDigest::default();
    for line in stdout.lines() {
        digest.observe(line);
    }
    digest.finish(stage, max_turns)
}

/// Running summary of a `stream-json` transcript, fed one line at a time.
///
/// Only what the reply needs is kept: the latest session id, every tool use,
/// and the last `result` event.
#[derive(Debug, Default)]
pub struct StreamDigest {
    session_id: Option<SessionId>,
    tool_uses: Vec<ToolUse>,
    result: Option<Value>,
}

impl StreamDigest {
    pub fn observe(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                debug!(err = %err, "skipping non-json stream line");
                return;
            }
        };
        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
            self.session_id = Some(SessionId::new(id));
        }
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => collect_tool_uses(&event, &mut self.tool_uses),
            Some("result") => self.result = Some(event),
            _ => {}
        }
    }

    pub fn finish(self, stage: StageName, max_turns: u32) -> Result<GatewayReply, PipelineError> {
        let Some(result) = self.result else {
            return Err(PipelineError::GatewayTransport {
                stage,
                message: "stream ended without a result event".to_string(),
            });
        };

        let subtype = result.get("subtype").and_then(Value::as_str).unwrap_or("");
        if subtype == "error_max_turns" {
            return Err(PipelineError::TurnBudgetExhausted { stage, max_turns });
        }
        let is_error = result
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error || subtype.starts_with("error") {
            let message = result
                .get("result")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(subtype);
            return Err(PipelineError::GatewayTransport {
                stage,
                message: format!("service reported an error: {message}"),
            });
        }

        let payload = extract_payload(stage, &result)?;
        let turns = result
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        Ok(GatewayReply {
            payload,
            session_id: self.session_id,
            tool_uses: self.tool_uses,
            turns,
        })
    }
}

fn collect_tool_uses(event: &Value, out: &mut Vec<ToolUse>) {
    let Some(content) = event
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return;
    };
    for block in content {
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            continue;
        }
        let name = block
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string();
        out.push(ToolUse {
            capability: capability_for_tool(&name),
            name,
        });
    }
}

/// `structured_output` when present, otherwise the final text parsed as JSON.
fn extract_payload(stage: StageName, result: &Value) -> Result<Value, PipelineError> {
    if let Some(structured) = result.get("structured_output").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    let text = result.get("result").and_then(Value::as_str).unwrap_or("");
    serde_json::from_str(strip_fences(text)).map_err(|err| PipelineError::SchemaViolation {
        stage,
        details: vec![format!("result is not a JSON document: {err}")],
    })
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn write_gateway_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gateway log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("claude"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("claude"));
    if output.timed_out() {
        buf.push_str("\n[claude timed out]\n");
    }
    if output.cancelled() {
        buf.push_str("\n[claude cancelled]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }

    fs::write(path, buf).with_context(|| format!("write gateway log {}", path.display()))
}
