//! Verifier agent: reviews the change set, writes and runs tests.
//!
//! Test files the verifier writes are reported in `tests_written` and are
//! never folded into `changes`.

use tracing::{info, instrument};

use crate::core::capability::{Capability, CapabilitySet};
use crate::core::state::PipelineState;
use crate::core::types::{StageName, VerifierResult};
use crate::error::PipelineError;
use crate::io::gateway::Gateway;
use crate::io::probe::RepoProbe;
use crate::io::prompt::PromptInputs;

use super::{StageCall, StageRuntime, call_stage, resolve_tests_dir};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::ReadFile,
    Capability::RunShell,
    Capability::SearchContents,
    Capability::ListFiles,
    Capability::WriteFile,
    Capability::EditFile,
]);

pub const SYSTEM_PROMPT: &str =
    "You are a rigorous reviewer. You verify changes by reading them and by writing and running tests.";

pub const RESULT_SCHEMA: &str = include_str!("../../schemas/verifier_output.schema.json");

#[derive(Debug, Clone, Default)]
pub struct VerifierAgent<P> {
    probe: P,
}

impl<P: RepoProbe> VerifierAgent<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    #[instrument(skip_all, fields(task_id = %state.task_id(), changes = state.changes().len()))]
    pub fn run<G: Gateway + ?Sized>(
        &self,
        gateway: &G,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
    ) -> Result<VerifierResult, PipelineError> {
        let touched = state.touched_files();
        let tests_dir = resolve_tests_dir(&self.probe, state.workspace_path(), &touched);
        let call = StageCall {
            stage: StageName::Verifier,
            capabilities: CAPABILITIES,
            system_prompt: SYSTEM_PROMPT,
            result_schema: RESULT_SCHEMA,
            inputs: PromptInputs {
                task: state.original_prompt().to_string(),
                changes: state.changes().to_vec(),
                tests_dir: Some(tests_dir.display().to_string()),
                result_schema: RESULT_SCHEMA.to_string(),
                ..PromptInputs::default()
            },
            workdir: state.workspace_path(),
            model: state.model(),
            resume: runtime.resume_for(state, StageName::Verifier),
            schema_retries: runtime.config.retry.retry_schema_violations,
        };
        let invocation = call_stage::<G, VerifierResult>(gateway, runtime, call)?;
        if let Some(id) = invocation.session_id {
            state.record_session(StageName::Verifier, id);
        }

        let result = invocation.result;
        info!(
            passed = result.passed,
            tests_passed = result.tests_passed,
            bugs = result.bugs.len(),
            tests_written = result.tests_written.len(),
            "verification finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::SessionId;
    use crate::core::types::{PipelineMode, ResolvedMode, Severity};
    use crate::io::config::PipelineConfig;
    use crate::test_support::{
        ScriptedGateway, ScriptedReply, bug, change, task, verifier_fail, verifier_pass,
    };
    use std::path::{Path, PathBuf};

    struct FixedProbe(Option<PathBuf>);

    impl RepoProbe for FixedProbe {
        fn find_repository_root(&self, _: &Path, _: &[String]) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    fn state_with_change(workspace: &Path) -> PipelineState {
        let mut state = PipelineState::new(
            task(workspace, PipelineMode::Full, "fix the parser"),
            ResolvedMode::Full,
        );
        let record = serde_json::from_value(change("src/x.ts", "modified", "parser fix"))
            .expect("change");
        state.upsert_changes([record]);
        state
    }

    /// Verifies tests go under the probed repository root and the prompt names the changes.
    #[test]
    fn tests_dir_uses_repository_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let gateway = ScriptedGateway::new([ScriptedReply::stage(
            StageName::Verifier,
            verifier_pass(),
        )]);
        let mut state = state_with_change(temp.path());
        let agent = VerifierAgent::new(FixedProbe(Some(PathBuf::from("/srv/repo"))));

        let result = agent.run(&gateway, &runtime, &mut state).expect("verify");

        assert!(result.passed);
        let prompt = &gateway.requests()[0].prompt;
        assert!(prompt.contains("/srv/repo/tests"));
        assert!(prompt.contains("`src/x.ts` (modified)"));
    }

    #[test]
    fn tests_dir_falls_back_to_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let gateway = ScriptedGateway::new([ScriptedReply::ok(verifier_pass())]);
        let mut state = state_with_change(temp.path());

        VerifierAgent::new(FixedProbe(None))
            .run(&gateway, &runtime, &mut state)
            .expect("verify");
        let expected = temp.path().join("tests").display().to_string();
        assert!(gateway.requests()[0].prompt.contains(&expected));
    }

    /// Verifies tests written by the verifier are not added to the change set.
    #[test]
    fn written_tests_do_not_enter_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let gateway = ScriptedGateway::new([ScriptedReply::ok(verifier_fail(vec![bug(
            "src/x.ts",
            4,
            "high",
            "off by one",
        )]))]);
        let mut state = state_with_change(temp.path());

        let result = VerifierAgent::new(FixedProbe(None))
            .run(&gateway, &runtime, &mut state)
            .expect("verify");

        assert!(!result.passed);
        assert_eq!(result.bugs[0].severity, Severity::High);
        assert_eq!(result.tests_written.len(), 1);
        assert_eq!(state.changes().len(), 1);
    }

    /// Verifies one schema violation is retried before a valid result is accepted.
    #[test]
    fn schema_violation_is_retried_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let gateway = ScriptedGateway::new([
            ScriptedReply::ok(serde_json::json!({ "passed": true })),
            ScriptedReply::ok(verifier_pass()),
        ]);
        VerifierAgent::new(FixedProbe(None))
            .run(&gateway, &runtime, &mut state_with_change(temp.path()))
            .expect("verify");
        assert_eq!(gateway.requests().len(), 2);

        let gateway = ScriptedGateway::new([
            ScriptedReply::ok(serde_json::json!({ "passed": true })),
            ScriptedReply::ok(serde_json::json!({ "passed": true })),
        ]);
        let err = VerifierAgent::new(FixedProbe(None))
            .run(&gateway, &runtime, &mut state_with_change(temp.path()))
            .expect_err("schema");
        assert!(matches!(err, PipelineError::SchemaViolation { .. }));
    }

    #[test]
    fn re_verification_resumes_prior_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::default();
        let runtime = StageRuntime::new(&config, None);
        let mut state = state_with_change(temp.path());
        state.record_session(StageName::Verifier, SessionId::new("v-1"));
        let gateway = ScriptedGateway::new([ScriptedReply::ok(verifier_pass())]);

        VerifierAgent::new(FixedProbe(None))
            .run(&gateway, &runtime, &mut state)
            .expect("verify");
        assert_eq!(gateway.requests()[0].resume, Some(SessionId::new("v-1")));
    }
}
