//! Gateway abstraction for completion-service invocation.
//!
//! The [`Gateway`] trait decouples stage agents from the actual completion
//! backend (currently the `claude` CLI, see [`crate::io::claude`]). Tests use
//! scripted gateways that return predetermined payloads without spawning
//! processes.
//!
//! Everything a gateway returns passes through [`invoke_validated`] before a
//! stage sees it: the tool transcript is audited against the capability grant,
//! then the payload is checked against the stage's result schema.

use std::path::PathBuf;
use std::time::Duration;

use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::SessionId;
use crate::core::types::StageName;
use crate::error::PipelineError;

/// Parameters for a single gateway invocation.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub stage: StageName,
    /// Working directory for the service's tool calls.
    pub workdir: PathBuf,
    /// Prompt text, with the result schema already embedded.
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    /// Tools the service may use. Everything else is disallowed.
    pub capabilities: CapabilitySet,
    pub max_turns: u32,
    /// JSON Schema (Draft 2020-12) the payload must satisfy.
    pub result_schema: String,
    /// Continue an earlier session instead of starting a fresh one.
    pub resume: Option<SessionId>,
    /// Hard wall-clock limit, independent of `max_turns`.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Path to write the raw event stream.
    pub stream_path: Option<PathBuf>,
    /// Path to write service stdout/stderr.
    pub log_path: Option<PathBuf>,
    pub cancel: CancelToken,
}

/// A tool invocation observed in the service transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    pub name: String,
    /// `None` when the tool has no capability counterpart.
    pub capability: Option<Capability>,
}

/// Raw, unvalidated reply from a gateway.
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub payload: Value,
    pub session_id: Option<SessionId>,
    pub tool_uses: Vec<ToolUse>,
    pub turns: Option<u32>,
}

/// Abstraction over completion-service backends.
pub trait Gateway {
    /// Run one call. Implementations map backend failures onto the gateway
    /// error variants of [`PipelineError`] and never validate the payload.
    fn invoke(&self, request: &GatewayRequest) -> Result<GatewayReply, PipelineError>;
}

impl<G: Gateway + ?Sized> Gateway for &G {
    fn invoke(&self, request: &GatewayRequest) -> Result<GatewayReply, PipelineError> {
        (**self).invoke(request)
    }
}

/// A schema-validated result together with its continuation handle.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    pub result: T,
    pub session_id: Option<SessionId>,
    /// The validated payload as returned by the service.
    pub raw: Value,
}

/// Invoke the gateway, audit tool use, validate the payload and deserialize it.
///
/// No partial result is ever returned: any mismatch fails the whole call.
#[instrument(skip_all, fields(stage = %request.stage, max_turns = request.max_turns))]
pub fn invoke_validated<G: Gateway + ?Sized, T: DeserializeOwned>(
    gateway: &G,
    request: &GatewayRequest,
) -> Result<Invocation<T>, PipelineError> {
    let reply = gateway.invoke(request)?;
    debug!(
        tool_uses = reply.tool_uses.len(),
        turns = ?reply.turns,
        "gateway replied"
    );
    audit_tool_uses(request.stage, request.capabilities, &reply.tool_uses)?;

    let schema: Value = serde_json::from_str(&request.result_schema).map_err(|err| {
        PipelineError::Internal(anyhow::anyhow!(
            "{} result schema is not valid JSON: {err}",
            request.stage
        ))
    })?;
    validate_payload(request.stage, &reply.payload, &schema)?;

    let result = serde_json::from_value(reply.payload.clone()).map_err(|err| {
        PipelineError::SchemaViolation {
            stage: request.stage,
            details: vec![err.to_string()],
        }
    })?;
    Ok(Invocation {
        result,
        session_id: reply.session_id,
        raw: reply.payload,
    })
}

/// Validate a payload against a JSON Schema (Draft 2020-12).
pub fn validate_payload(
    stage: StageName,
    payload: &Value,
    schema: &Value,
) -> Result<(), PipelineError> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| {
            PipelineError::Internal(anyhow::anyhow!("compile {stage} result schema: {err}"))
        })?;
    let details: Vec<String> = compiled
        .iter_errors(payload)
        .map(|err| err.to_string())
        .collect();
    if !details.is_empty() {
        warn!(%stage, violations = details.len(), "payload failed schema validation");
        return Err(PipelineError::SchemaViolation { stage, details });
    }
    Ok(())
}

/// Fail closed on the first tool use outside `granted`.
pub fn audit_tool_uses(
    stage: StageName,
    granted: CapabilitySet,
    tool_uses: &[ToolUse],
) -> Result<(), PipelineError> {
    for tool in tool_uses {
        let allowed = tool.capability.is_some_and(|cap| granted.contains(cap));
        if !allowed {
            warn!(%stage, tool = %tool.name, "tool use outside capability grant");
            return Err(PipelineError::CapabilityViolation {
                stage,
                tool: tool.name.clone(),
            });
        }
    }
    Ok(())
}
