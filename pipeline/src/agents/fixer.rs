//! Fixer agent: repairs reported bugs and merges its edits into the change set.

use tracing::{info, instrument};

use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::PipelineState;
use crate::core::types::{FixerResult, StageName, VerifierResult};
use crate::error::PipelineError;
use crate::io::gateway::Gateway;
use crate::io::prompt::PromptInputs;

use super::{StageCall, StageRuntime, call_stage};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::ReadFile,
    Capability::EditFile,
    Capability::WriteFile,
    Capability::RunShell,
]);

pub const SYSTEM_PROMPT: &str =
    "You are a senior engineer fixing reported defects with minimal, targeted edits.";

pub const RESULT_SCHEMA: &str = include_str!("../../schemas/fixer_output.schema.json");

#[derive(Debug, Clone, Copy, Default)]
pub struct FixerAgent;

impl FixerAgent {
    /// Fix the bugs and failing tests of `verification`.
    ///
    /// Each returned change is upserted by file: a file already in the change
    /// set is replaced in place, a new file is appended.
    #[instrument(skip_all, fields(task_id = %state.task_id(), bugs = verification.bugs.len()))]
    pub fn run<G: Gateway + ?Sized>(
        &self,
        gateway: &G,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
        verification: &VerifierResult,
    ) -> Result<FixerResult, PipelineError> {
        let call = StageCall {
            stage: StageName::Fixer,
            capabilities: CAPABILITIES,
            system_prompt: SYSTEM_PROMPT,
            result_schema: RESULT_SCHEMA,
            inputs: PromptInputs {
                task: state.original_prompt().to_string(),
                changes: state.changes().to_vec(),
                bugs: verification.bugs.clone(),
                failing_tests: verification.failing_tests().cloned().collect(),
                result_schema: RESULT_SCHEMA.to_string(),
                ..PromptInputs::default()
            },
            workdir: state.workspace_path(),
            model: state.model(),
            resume: runtime.resume_for(state, StageName::Fixer),
            schema_retries: runtime.config.retry.retry_schema_violations,
        };
        let invocation = call_stage::<G, FixerResult>(gateway, runtime, call)?;
        if let Some(id) = invocation.session_id {
            state.record_session(StageName::Fixer, id);
        }

        let result = invocation.result;
        let summary = state.upsert_changes(result.changes.iter().cloned());
        info!(
            fixed = result.fixed.len(),
            inserted = summary.inserted,
            replaced = summary.replaced,
            "fixes merged"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChangeAction, PipelineMode, ResolvedMode};
    use crate::io::config::PipelineConfig;
    use crate::test_support::{
        ScriptedGateway, ScriptedReply, bug, change, fixer_payload, task, verifier_fail,
    };
    use serde_json::json;

    fn state(workspace: &std::path::Path) -> PipelineState {
        let mut state = PipelineState::new(
            task(workspace, PipelineMode::Full, "fix the parser"),
            ResolvedMode::Full,
        );
        let records = vec![
            serde_json::from_value(change("src/a.ts", "modified", "a v1")).expect("change"),
            serde_json::from_value(change("src/b.ts", "created", "b v1")).expect("change"),
        ];
        state.upsert_changes(records);
        state
    }

    fn verification() -> VerifierResult {
        serde_json::from_value(verifier_fail(vec![bug("src/a.ts", 7, "critical", "panics")]))
            .expect("verification")
    }

    /// Verifies replaced files keep their position and new files are appended.
    #[test]
    fn merges_changes_in_place_and_appends_new_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let gateway = ScriptedGateway::new([ScriptedReply::stage(
            StageName::Fixer,
            fixer_payload(
                vec![json!({ "file": "src/a.ts", "bug": "panics", "fix": "guard index" })],
                vec![
                    change("src/a.ts", "modified", "a v2"),
                    change("src/c.ts", "created", "helper"),
                ],
            ),
        )]);
        let mut state = state(temp.path());

        let result = FixerAgent
            .run(&gateway, &runtime, &mut state, &verification())
            .expect("fix");

        assert_eq!(result.fixed.len(), 1);
        let files: Vec<_> = state.changes().iter().map(|c| c.file.as_str()).collect();
        assert_eq!(files, vec!["src/a.ts", "src/b.ts", "src/c.ts"]);
        assert_eq!(state.changes()[0].summary, "a v2");
        assert_eq!(state.changes()[2].action, ChangeAction::Created);
        assert!(state.session(StageName::Fixer).is_some());

        let request = &gateway.requests()[0];
        assert_eq!(request.capabilities, CAPABILITIES);
        assert!(request.prompt.contains("[critical] `src/a.ts:7`: panics"));
        assert!(request.prompt.contains("regression"));
    }

    /// Verifies applying the same fix output twice does not grow the change set.
    #[test]
    fn repeated_fix_output_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let payload = fixer_payload(Vec::new(), vec![change("src/a.ts", "modified", "a v2")]);
        let gateway = ScriptedGateway::new([
            ScriptedReply::ok(payload.clone()),
            ScriptedReply::ok(payload),
        ]);
        let mut state = state(temp.path());

        FixerAgent
            .run(&gateway, &runtime, &mut state, &verification())
            .expect("fix");
        let after_first = state.changes().to_vec();
        FixerAgent
            .run(&gateway, &runtime, &mut state, &verification())
            .expect("fix");
        assert_eq!(state.changes(), after_first.as_slice());
    }

    #[test]
    fn missing_changes_array_is_schema_violation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = PipelineConfig::default();
        config.retry.retry_schema_violations = 0;
        let runtime = StageRuntime::new(&config, None);
        let gateway = ScriptedGateway::new([ScriptedReply::ok(json!({ "fixed": [] }))]);
        let mut state = state(temp.path());

        let err = FixerAgent
            .run(&gateway, &runtime, &mut state, &verification())
            .expect_err("schema");
        assert!(matches!(err, PipelineError::SchemaViolation { .. }));
        assert_eq!(state.changes().len(), 2);
    }

    #[test]
    fn fixer_may_not_search_or_list() {
        assert!(!CAPABILITIES.contains(Capability::SearchContents));
        assert!(!CAPABILITIES.contains(Capability::ListFiles));
    }
}
