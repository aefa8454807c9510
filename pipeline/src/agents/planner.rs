//! Planner agent: explores the workspace read-only and produces a Plan Result.

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::PipelineState;
use crate::core::types::{PlanResult, PlanStep, StageName};
use crate::error::PipelineError;
use crate::io::gateway::Gateway;
use crate::io::prompt::PromptInputs;

use super::{StageCall, StageRuntime, call_stage};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::ReadFile,
    Capability::SearchContents,
    Capability::ListFiles,
]);

pub const SYSTEM_PROMPT: &str =
    "You are a senior engineer planning a code change. You never modify files.";

pub const RESULT_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");

/// Planner payload as the schema admits it. `plan` is checked after validation.
#[derive(Debug, Deserialize)]
struct PlannerPayload {
    #[serde(default)]
    plan: Option<Vec<PlanStep>>,
    files_to_modify: Vec<String>,
    considerations: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlannerAgent;

impl PlannerAgent {
    /// Produce a plan. Never touches `changes`.
    ///
    /// The session id is recorded even when the plan turns out to be malformed.
    #[instrument(skip_all, fields(task_id = %state.task_id()))]
    pub fn run<G: Gateway + ?Sized>(
        &self,
        gateway: &G,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
    ) -> Result<PlanResult, PipelineError> {
        let task = state
            .enriched_prompt()
            .unwrap_or(state.original_prompt())
            .to_string();
        let call = StageCall {
            stage: StageName::Planner,
            capabilities: CAPABILITIES,
            system_prompt: SYSTEM_PROMPT,
            result_schema: RESULT_SCHEMA,
            inputs: PromptInputs {
                task,
                targets: state.target_paths().to_vec(),
                result_schema: RESULT_SCHEMA.to_string(),
                ..PromptInputs::default()
            },
            workdir: state.workspace_path(),
            model: state.model(),
            resume: None,
            schema_retries: 0,
        };
        let invocation = call_stage::<G, PlannerPayload>(gateway, runtime, call)?;
        if let Some(id) = invocation.session_id {
            state.record_session(StageName::Planner, id);
        }

        let payload = invocation.result;
        let plan = match payload.plan {
            None => {
                warn!("planner omitted plan");
                return Err(PipelineError::MalformedPlan {
                    reason: "plan is missing".to_string(),
                });
            }
            Some(plan) if plan.is_empty() => {
                warn!("planner returned an empty plan");
                return Err(PipelineError::MalformedPlan {
                    reason: "plan is empty".to_string(),
                });
            }
            Some(plan) => plan,
        };
        info!(steps = plan.len(), "plan ready");
        Ok(PlanResult {
            plan,
            files_to_modify: payload.files_to_modify,
            considerations: payload.considerations,
        })
    }
}
