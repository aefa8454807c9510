//! Implementer agent: applies the plan and populates the change set.

use tracing::{info, instrument};

use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::PipelineState;
use crate::core::types::{ImplementerResult, PlanResult, StageName};
use crate::error::PipelineError;
use crate::io::gateway::Gateway;
use crate::io::prompt::PromptInputs;

use super::{StageCall, StageRuntime, call_stage};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&Capability::ALL);

pub const SYSTEM_PROMPT: &str =
    "You are a senior engineer implementing an agreed plan in an existing codebase.";

pub const RESULT_SCHEMA: &str = include_str!("../../schemas/implementer_output.schema.json");

#[derive(Debug, Clone, Copy, Default)]
pub struct ImplementerAgent;

impl ImplementerAgent {
    /// Apply `plan` and upsert the reported changes into `state`.
    #[instrument(skip_all, fields(task_id = %state.task_id(), steps = plan.plan.len()))]
    pub fn run<G: Gateway + ?Sized>(
        &self,
        gateway: &G,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
        plan: &PlanResult,
    ) -> Result<ImplementerResult, PipelineError> {
        let task = state
            .enriched_prompt()
            .unwrap_or(state.original_prompt())
            .to_string();
        let call = StageCall {
            stage: StageName::Implementer,
            capabilities: CAPABILITIES,
            system_prompt: SYSTEM_PROMPT,
            result_schema: RESULT_SCHEMA,
            inputs: PromptInputs {
                task,
                targets: state.target_paths().to_vec(),
                plan: Some(plan.clone()),
                result_schema: RESULT_SCHEMA.to_string(),
                ..PromptInputs::default()
            },
            workdir: state.workspace_path(),
            model: state.model(),
            resume: runtime.resume_for(state, StageName::Implementer),
            schema_retries: 0,
        };
        let invocation = call_stage::<G, ImplementerResult>(gateway, runtime, call)?;
        if let Some(id) = invocation.session_id {
            state.record_session(StageName::Implementer, id);
        }

        let result = invocation.result;
        let summary = state.upsert_changes(result.changes.iter().cloned());
        info!(
            inserted = summary.inserted,
            replaced = summary.replaced,
            unchanged = summary.unchanged,
            "implementation merged"
        );
        Ok(result)
    }
}
