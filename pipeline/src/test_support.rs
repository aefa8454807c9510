//! Test-only helpers: a scripted gateway and deterministic payload builders.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::state::{PipelineTask, SessionId};
use crate::core::types::{PipelineMode, StageName};
use crate::error::PipelineError;
use crate::io::claude::capability_for_tool;
use crate::io::gateway::{Gateway, GatewayReply, GatewayRequest, ToolUse};
use crate::io::git::Git;

/// One canned gateway response.
#[derive(Debug)]
pub struct ScriptedReply {
    /// When set, the call fails unless it comes from this stage.
    pub expect_stage: Option<StageName>,
    pub outcome: Result<GatewayReply, PipelineError>,
}

impl ScriptedReply {
    /// A successful call returning `payload`.
    pub fn ok(payload: Value) -> Self {
        Self {
            expect_stage: None,
            outcome: Ok(GatewayReply {
                payload,
                session_id: None,
                tool_uses: Vec::new(),
                turns: Some(1),
            }),
        }
    }

    pub fn fail(err: PipelineError) -> Self {
        Self {
            expect_stage: None,
            outcome: Err(err),
        }
    }

    /// Successful reply for `stage` with a session id of `<stage>-session`.
    pub fn stage(stage: StageName, payload: Value) -> Self {
        Self::ok(payload)
            .for_stage(stage)
            .with_session(&format!("{stage}-session"))
    }

    pub fn for_stage(mut self, stage: StageName) -> Self {
        self.expect_stage = Some(stage);
        self
    }

    pub fn with_session(mut self, id: &str) -> Self {
        if let Ok(reply) = &mut self.outcome {
            reply.session_id = Some(SessionId::new(id));
        }
        self
    }

    /// Record tool calls by CLI tool name.
    pub fn with_tools(mut self, names: &[&str]) -> Self {
        if let Ok(reply) = &mut self.outcome {
            reply.tool_uses = names
                .iter()
                .map(|name| ToolUse {
                    name: (*name).to_string(),
                    capability: capability_for_tool(name),
                })
                .collect();
        }
        self
    }
}

/// Gateway that replays scripted replies in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<GatewayRequest>>,
}

impl ScriptedGateway {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Stages in call order.
    pub fn stages(&self) -> Vec<StageName> {
        self.requests().iter().map(|r| r.stage).collect()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("replies lock").len()
    }
}

impl Gateway for ScriptedGateway {
    fn invoke(&self, request: &GatewayRequest) -> Result<GatewayReply, PipelineError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.replies.lock().expect("replies lock").pop_front();
        let Some(reply) = next else {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "script exhausted at {} call",
                request.stage
            )));
        };
        if let Some(expected) = reply.expect_stage
            && expected != request.stage
        {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "script expected a {expected} call but got {}",
                request.stage
            )));
        }
        reply.outcome
    }
}

/// Temporary git work tree used as a run workspace.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        Git::new(dir.path()).init()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}

/// Task with deterministic defaults rooted at `workspace`.
pub fn task(workspace: &Path, mode: PipelineMode, prompt: &str) -> PipelineTask {
    PipelineTask {
        task_id: "task-1".to_string(),
        original_prompt: prompt.to_string(),
        workspace_path: workspace.to_path_buf(),
        target_paths: Vec::new(),
        model: "sonnet".to_string(),
        pipeline_mode: mode,
        enriched_prompt: None,
    }
}

pub fn change(file: &str, action: &str, summary: &str) -> Value {
    json!({ "file": file, "action": action, "summary": summary })
}

/// Planner payload with one `modify` step per file.
pub fn plan_payload(files: &[&str]) -> Value {
    let steps: Vec<Value> = files
        .iter()
        .enumerate()
        .map(|(i, file)| {
            json!({
                "step": i + 1,
                "file": file,
                "action": "modify",
                "description": format!("update {file}"),
            })
        })
        .collect();
    json!({
        "plan": steps,
        "files_to_modify": files,
        "considerations": "",
    })
}

pub fn implementer_payload(changes: Vec<Value>) -> Value {
    json!({ "summary": "implemented", "changes": changes })
}

pub fn fixer_payload(fixed: Vec<Value>, changes: Vec<Value>) -> Value {
    json!({ "fixed": fixed, "changes": changes })
}

pub fn bug(file: &str, line: u32, severity: &str, description: &str) -> Value {
    json!({ "file": file, "line": line, "description": description, "severity": severity })
}

pub fn verifier_pass() -> Value {
    json!({
        "passed": true,
        "bugs": [],
        "test_results": [{ "name": "smoke", "passed": true, "output": "ok" }],
        "tests_written": ["tests/smoke.test.ts"],
        "tests_passed": true,
    })
}

/// Failing verdict with `bugs` and one failing test.
pub fn verifier_fail(bugs: Vec<Value>) -> Value {
    json!({
        "passed": false,
        "bugs": bugs,
        "test_results": [{ "name": "regression", "passed": false, "output": "assertion failed" }],
        "tests_written": ["tests/regression.test.ts"],
        "tests_passed": false,
    })
}

pub fn simple_payload(changes: Vec<Value>, verification: Value) -> Value {
    json!({ "summary": "done in one pass", "changes": changes, "verification": verification })
}
