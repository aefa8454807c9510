//! Stage contracts shared across the pipeline.
//!
//! These types mirror the JSON payloads each stage returns (see `schemas/`).
//! They carry no I/O and must stay stable: the result schemas and these serde
//! shapes are validated against each other in tests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stage identity, used as the key for continuation handles and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Planner,
    Implementer,
    Verifier,
    Fixer,
    /// Single call that plans, implements and verifies (`simple` mode).
    Simple,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Planner,
        StageName::Implementer,
        StageName::Verifier,
        StageName::Fixer,
        StageName::Simple,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Planner => "planner",
            StageName::Implementer => "implementer",
            StageName::Verifier => "verifier",
            StageName::Fixer => "fixer",
            StageName::Simple => "simple",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline mode requested by the task source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Simple,
    Auto,
    Fast,
    Full,
}

impl PipelineMode {
    /// Resolve to a concrete mode; `auto` defers to the supplied classifier result.
    pub fn resolve(self, classified: impl FnOnce() -> ResolvedMode) -> ResolvedMode {
        match self {
            PipelineMode::Simple => ResolvedMode::Simple,
            PipelineMode::Fast => ResolvedMode::Fast,
            PipelineMode::Full => ResolvedMode::Full,
            PipelineMode::Auto => classified(),
        }
    }
}

/// Mode the run actually executes once `auto` has been decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedMode {
    Simple,
    Fast,
    Full,
}

impl ResolvedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolvedMode::Simple => "simple",
            ResolvedMode::Fast => "fast",
            ResolvedMode::Full => "full",
        }
    }
}

/// File-level action recorded in the change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Modified,
    Deleted,
}

/// One file-level edit. The change set is keyed by `file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub file: String,
    pub action: ChangeAction,
    pub summary: String,
}

/// Action a plan step intends to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: u32,
    pub file: String,
    pub action: PlanAction,
    pub description: String,
}

/// Planner output after the non-empty `plan` check has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan: Vec<PlanStep>,
    pub files_to_modify: Vec<String>,
    pub considerations: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Unit of work for the fixer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bug {
    pub file: String,
    pub line: u32,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

/// Verifier output for one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierResult {
    pub passed: bool,
    pub bugs: Vec<Bug>,
    pub test_results: Vec<TestResult>,
    pub tests_written: Vec<String>,
    pub tests_passed: bool,
}

impl VerifierResult {
    pub fn failing_tests(&self) -> impl Iterator<Item = &TestResult> {
        self.test_results.iter().filter(|t| !t.passed)
    }
}

/// Informational record of a single fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRecord {
    pub file: String,
    pub bug: String,
    pub fix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixerResult {
    pub fixed: Vec<FixRecord>,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementerResult {
    pub summary: String,
    pub changes: Vec<ChangeRecord>,
}

/// Output of the single-call stage used by `simple` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleResult {
    pub summary: String,
    pub changes: Vec<ChangeRecord>,
    pub verification: VerifierResult,
}
