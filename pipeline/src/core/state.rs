//! Pipeline state threaded through every stage call.
//!
//! Task identity fields are private and exposed read-only; only the change set
//! and the continuation-handle map move during a run, and only through
//! [`PipelineState::upsert_changes`] and [`PipelineState::record_session`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::changes::{UpsertSummary, touched_files, upsert_changes};
use crate::core::types::{ChangeRecord, PipelineMode, ResolvedMode, StageName};

/// Opaque continuation handle returned by the gateway for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input supplied by the task source to start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub task_id: String,
    pub original_prompt: String,
    /// Absolute path to the working copy.
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub target_paths: Vec<String>,
    pub model: String,
    pub pipeline_mode: PipelineMode,
    /// Upstream-built planner prompt (e.g. opportunity context); replaces the plain prompt.
    #[serde(default)]
    pub enriched_prompt: Option<String>,
}

impl PipelineTask {
    pub fn validate(&self) -> Result<()> {
        validate_task_id(&self.task_id)?;
        if self.original_prompt.trim().is_empty() {
            bail!("task {}: prompt must not be empty", self.task_id);
        }
        if !self.workspace_path.is_absolute() {
            bail!(
                "task {}: workspace path must be absolute (got {})",
                self.task_id,
                self.workspace_path.display()
            );
        }
        if self.model.trim().is_empty() {
            bail!("task {}: model must not be empty", self.task_id);
        }
        Ok(())
    }
}

/// Task ids name artifact directories, so keep them to a safe alphabet.
pub fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 {
        bail!("task id must be 1-128 characters");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || id.starts_with('.')
    {
        bail!("invalid task id '{id}' (allowed: [A-Za-z0-9._-], not starting with '.')");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    task: PipelineTask,
    mode: ResolvedMode,
    changes: Vec<ChangeRecord>,
    session_ids: BTreeMap<StageName, SessionId>,
}

impl PipelineState {
    pub fn new(task: PipelineTask, mode: ResolvedMode) -> Self {
        Self {
            task,
            mode,
            changes: Vec::new(),
            session_ids: BTreeMap::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn original_prompt(&self) -> &str {
        &self.task.original_prompt
    }

    pub fn enriched_prompt(&self) -> Option<&str> {
        self.task.enriched_prompt.as_deref()
    }

    pub fn workspace_path(&self) -> &Path {
        &self.task.workspace_path
    }

    pub fn target_paths(&self) -> &[String] {
        &self.task.target_paths
    }

    pub fn model(&self) -> &str {
        &self.task.model
    }

    pub fn resolved_mode(&self) -> ResolvedMode {
        self.mode
    }

    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    pub fn touched_files(&self) -> Vec<String> {
        touched_files(&self.changes)
    }

    pub fn upsert_changes<I>(&mut self, incoming: I) -> UpsertSummary
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        upsert_changes(&mut self.changes, incoming, &self.task.workspace_path)
    }

    pub fn session_ids(&self) -> &BTreeMap<StageName, SessionId> {
        &self.session_ids
    }

    pub fn session(&self, stage: StageName) -> Option<&SessionId> {
        self.session_ids.get(&stage)
    }

    /// Record the latest continuation handle for `stage`, replacing any earlier one.
    pub fn record_session(&mut self, stage: StageName, id: SessionId) {
        self.session_ids.insert(stage, id);
    }

    /// Consume the state into the caller-facing pieces.
    pub fn into_parts(self) -> (Vec<ChangeRecord>, BTreeMap<StageName, SessionId>) {
        (self.changes, self.session_ids)
    }
}
