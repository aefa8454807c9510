//! Single-pass agent for `simple` mode: plan, implement and verify in one call.

use tracing::{info, instrument};

use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::PipelineState;
use crate::core::types::{SimpleResult, StageName};
use crate::error::PipelineError;
use crate::io::gateway::Gateway;
use crate::io::probe::RepoProbe;
use crate::io::prompt::PromptInputs;

use super::{StageCall, StageRuntime, call_stage, resolve_tests_dir};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&Capability::ALL);

pub const SYSTEM_PROMPT: &str =
    "You are a senior engineer making a small, self-contained change and checking it yourself.";

pub const RESULT_SCHEMA: &str = include_str!("../../schemas/simple_output.schema.json");

#[derive(Debug, Clone, Default)]
pub struct SimpleAgent<P> {
    probe: P,
}

impl<P: RepoProbe> SimpleAgent<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    #[instrument(skip_all, fields(task_id = %state.task_id()))]
    pub fn run<G: Gateway + ?Sized>(
        &self,
        gateway: &G,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
    ) -> Result<SimpleResult, PipelineError> {
        let tests_dir =
            resolve_tests_dir(&self.probe, state.workspace_path(), state.target_paths());
        let task = state
            .enriched_prompt()
            .unwrap_or(state.original_prompt())
            .to_string();
        let call = StageCall {
            stage: StageName::Simple,
            capabilities: CAPABILITIES,
            system_prompt: SYSTEM_PROMPT,
            result_schema: RESULT_SCHEMA,
            inputs: PromptInputs {
                task,
                targets: state.target_paths().to_vec(),
                tests_dir: Some(tests_dir.display().to_string()),
                result_schema: RESULT_SCHEMA.to_string(),
                ..PromptInputs::default()
            },
            workdir: state.workspace_path(),
            model: state.model(),
            resume: None,
            schema_retries: runtime.config.retry.retry_schema_violations,
        };
        let invocation = call_stage::<G, SimpleResult>(gateway, runtime, call)?;
        if let Some(id) = invocation.session_id {
            state.record_session(StageName::Simple, id);
        }

        let result = invocation.result;
        state.upsert_changes(result.changes.iter().cloned());
        info!(
            changes = state.changes().len(),
            passed = result.verification.passed,
            "single pass finished"
        );
        Ok(result)
    }
}
