//! Stage agents wrapping the gateway.
//!
//! Each agent owns its capability grant, system prompt and result schema. The
//! shared [`call_stage`] helper renders the prompt, writes run artifacts,
//! applies the run deadline and retries the failure classes that may be
//! retried. Agents alone decide what a validated result does to the state.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{backoff_delay, call_timeout};
use crate::core::cancel::CancelToken;
use crate::core::capability::CapabilitySet;
use crate::core::state::{PipelineState, SessionId};
use crate::core::types::StageName;
use crate::error::PipelineError;
use crate::io::config::PipelineConfig;
use crate::io::gateway::{Gateway, GatewayRequest, Invocation, invoke_validated};
use crate::io::probe::RepoProbe;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::run_log::RunLog;

pub mod fixer;
pub mod implementer;
pub mod planner;
pub mod simple;
pub mod verifier;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run-wide settings shared by every stage call.
#[derive(Debug, Clone)]
pub struct StageRuntime<'a> {
    pub config: &'a PipelineConfig,
    /// Where call artifacts go. `None` skips artifact writing.
    pub run_log: Option<&'a RunLog>,
    pub deadline: Instant,
    pub cancel: CancelToken,
}

impl<'a> StageRuntime<'a> {
    pub fn new(config: &'a PipelineConfig, run_log: Option<&'a RunLog>) -> Self {
        Self {
            config,
            run_log,
            deadline: Instant::now() + config.run_timeout(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Session to resume when `stage` runs again within this run.
    fn resume_for(&self, state: &PipelineState, stage: StageName) -> Option<SessionId> {
        if !self.config.resume_sessions {
            return None;
        }
        state.session(stage).cloned()
    }
}

/// Everything stage-specific about one gateway call.
#[derive(Debug, Clone)]
pub(crate) struct StageCall<'a> {
    pub stage: StageName,
    pub capabilities: CapabilitySet,
    pub system_prompt: &'static str,
    pub result_schema: &'static str,
    pub inputs: PromptInputs,
    pub workdir: &'a Path,
    pub model: &'a str,
    pub resume: Option<SessionId>,
    /// Re-invocations allowed after a schema violation.
    pub schema_retries: u32,
}

/// Invoke the gateway for one stage, retrying transport and (optionally) schema failures.
#[instrument(skip_all, fields(stage = %call.stage, resume = call.resume.is_some()))]
pub(crate) fn call_stage<G: Gateway + ?Sized, T: DeserializeOwned>(
    gateway: &G,
    runtime: &StageRuntime<'_>,
    call: StageCall<'_>,
) -> Result<Invocation<T>, PipelineError> {
    let stage = call.stage;
    let stage_config = runtime.config.stages.get(stage);
    let prompt = PromptBuilder::new(runtime.config.prompt_budget_bytes)
        .build(stage, &call.inputs)?
        .render();

    let mut transport_failures = 0u32;
    let mut schema_failures = 0u32;
    loop {
        if runtime.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        let Some(timeout) = call_timeout(runtime.config.call_timeout(stage), runtime.deadline)
        else {
            warn!("run deadline passed before the call started");
            return Err(PipelineError::GatewayTimeout {
                stage,
                timeout: runtime.config.run_timeout(),
            });
        };

        let paths = match runtime.run_log {
            Some(log) => Some(log.next_call(stage)?),
            None => None,
        };
        if let Some(paths) = &paths {
            paths.write_prompt(&prompt)?;
        }

        let request = GatewayRequest {
            stage,
            workdir: call.workdir.to_path_buf(),
            prompt: prompt.clone(),
            system_prompt: Some(call.system_prompt.to_string()),
            model: call.model.to_string(),
            capabilities: call.capabilities,
            max_turns: stage_config.max_turns,
            result_schema: call.result_schema.to_string(),
            resume: call.resume.clone(),
            timeout,
            output_limit_bytes: runtime.config.gateway.output_limit_bytes,
            stream_path: paths.as_ref().map(|p| p.stream_path.clone()),
            log_path: paths.as_ref().map(|p| p.gateway_log_path.clone()),
            cancel: runtime.cancel.clone(),
        };

        info!(max_turns = request.max_turns, timeout_secs = timeout.as_secs(), "invoking stage");
        let err = match invoke_validated::<G, T>(gateway, &request) {
            Ok(invocation) => {
                if let Some(paths) = &paths {
                    paths.write_output(&invocation.raw)?;
                }
                debug!(session = ?invocation.session_id, "stage call succeeded");
                return Ok(invocation);
            }
            Err(err) => err,
        };
        if let Some(paths) = &paths {
            paths.write_error(&err.to_string())?;
        }

        if err.is_retryable() && transport_failures < runtime.config.gateway.transport_retries {
            transport_failures += 1;
            let delay = backoff_delay(runtime.config.backoff(), transport_failures);
            warn!(
                err = %err,
                attempt = transport_failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying after transport failure"
            );
            sleep_cancellable(delay, &runtime.cancel);
            continue;
        }
        if matches!(err, PipelineError::SchemaViolation { .. })
            && schema_failures < call.schema_retries
        {
            schema_failures += 1;
            warn!(err = %err, attempt = schema_failures, "retrying after schema violation");
            continue;
        }
        return Err(err);
    }
}

fn sleep_cancellable(delay: Duration, cancel: &CancelToken) {
    let until = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(CANCEL_POLL_INTERVAL));
    }
}

/// Tests directory for files touched so far: `<root>/tests`, else `<workspace>/tests`.
pub fn resolve_tests_dir<P: RepoProbe + ?Sized>(
    probe: &P,
    workspace: &Path,
    candidates: &[String],
) -> PathBuf {
    match probe.find_repository_root(workspace, candidates) {
        Some(root) => root.join("tests"),
        None => workspace.join("tests"),
    }
}
