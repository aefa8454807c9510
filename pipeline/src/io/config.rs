//! Pipeline configuration stored under `<workspace>/.pipeline/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ClassifierThresholds;
use crate::core::transition::{RetryPolicy, RetryStrategy};
use crate::core::types::{Severity, StageName};

/// Directory under the workspace holding config and run artifacts.
pub const PIPELINE_DIR: &str = ".pipeline";

/// Default config location for a workspace.
pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(PIPELINE_DIR).join("config.toml")
}

/// Pipeline configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in [`PipelineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model used when a task does not name one.
    pub default_model: String,

    /// Wall-clock budget for a whole run. Each call is clipped to what remains.
    pub run_timeout_secs: u64,

    /// Prompts above this size drop droppable sections, then truncate.
    pub prompt_budget_bytes: usize,

    /// Run artifacts directory, relative to the workspace.
    pub artifacts_dir: String,

    /// Resume a stage's own session when it is invoked again within a run.
    pub resume_sessions: bool,

    /// Upper bound on runs executing at once in a batch.
    pub max_concurrent_runs: usize,

    pub gateway: GatewayConfig,
    pub stages: StagesConfig,
    pub retry: RetryConfig,
    pub auto: ClassifierThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Completion-service CLI binary.
    pub binary: String,
    /// Hard per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Truncate captured service output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Re-invocations allowed after a transport failure or timeout.
    pub transport_retries: u32,
    /// Base of the linear backoff between re-invocations.
    pub backoff_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            timeout_secs: 15 * 60,
            output_limit_bytes: 2_000_000,
            transport_retries: 2,
            backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub max_turns: u32,
    /// Overrides `gateway.timeout_secs` for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageConfig {
    const fn turns(max_turns: u32) -> Self {
        Self {
            max_turns,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    pub planner: StageConfig,
    pub implementer: StageConfig,
    pub verifier: StageConfig,
    pub fixer: StageConfig,
    pub simple: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            planner: StageConfig::turns(30),
            implementer: StageConfig::turns(50),
            verifier: StageConfig::turns(40),
            fixer: StageConfig::turns(30),
            simple: StageConfig::turns(80),
        }
    }
}

impl StagesConfig {
    pub fn get(&self, stage: StageName) -> &StageConfig {
        match stage {
            StageName::Planner => &self.planner,
            StageName::Implementer => &self.implementer,
            StageName::Verifier => &self.verifier,
            StageName::Fixer => &self.fixer,
            StageName::Simple => &self.simple,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Fix rounds allowed before the run fails with an exhausted budget.
    pub max_fix_rounds: u32,
    pub policy: RetryStrategy,
    /// Bugs below this severity do not block completion once tests pass.
    pub blocking_severity: Severity,
    /// Re-invocations allowed when the verifier or fixer violates its schema.
    pub retry_schema_violations: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_fix_rounds: policy.max_fix_rounds,
            policy: policy.strategy,
            blocking_severity: policy.blocking_severity,
            retry_schema_violations: 1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_fix_rounds: self.max_fix_rounds,
            strategy: self.policy,
            blocking_severity: self.blocking_severity,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            run_timeout_secs: 2 * 60 * 60,
            prompt_budget_bytes: 200_000,
            artifacts_dir: format!("{PIPELINE_DIR}/runs"),
            resume_sessions: true,
            max_concurrent_runs: 4,
            gateway: GatewayConfig::default(),
            stages: StagesConfig::default(),
            retry: RetryConfig::default(),
            auto: ClassifierThresholds::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_model.trim().is_empty() {
            return Err(anyhow!("default_model must be non-empty"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.artifacts_dir.trim().is_empty() {
            return Err(anyhow!("artifacts_dir must be non-empty"));
        }
        if Path::new(&self.artifacts_dir).is_absolute() {
            return Err(anyhow!("artifacts_dir must be relative to the workspace"));
        }
        if self.max_concurrent_runs == 0 {
            return Err(anyhow!("max_concurrent_runs must be > 0"));
        }
        if self.gateway.binary.trim().is_empty() {
            return Err(anyhow!("gateway.binary must be non-empty"));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(anyhow!("gateway.timeout_secs must be > 0"));
        }
        if self.gateway.output_limit_bytes == 0 {
            return Err(anyhow!("gateway.output_limit_bytes must be > 0"));
        }
        for stage in StageName::ALL {
            let cfg = self.stages.get(stage);
            if cfg.max_turns == 0 {
                return Err(anyhow!("stages.{stage}.max_turns must be > 0"));
            }
            if cfg.timeout_secs == Some(0) {
                return Err(anyhow!("stages.{stage}.timeout_secs must be > 0"));
            }
        }
        if self.auto.simple_max_words >= self.auto.full_min_words {
            return Err(anyhow!(
                "auto.simple_max_words must be < auto.full_min_words"
            ));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Hard per-call timeout for `stage`.
    pub fn call_timeout(&self, stage: StageName) -> Duration {
        let secs = self
            .stages
            .get(stage)
            .timeout_secs
            .unwrap_or(self.gateway.timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.gateway.backoff_ms)
    }

    /// Run artifacts root for a workspace.
    pub fn artifacts_root(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.artifacts_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let cfg = PipelineConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Verifies partial files keep defaults for everything they omit.
    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_model = "opus"
max_concurrent_runs = 2

[retry]
max_fix_rounds = 4
policy = "diminishing_bugs"
blocking_severity = "high"

[stages.verifier]
max_turns = 12
timeout_secs = 90
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.default_model, "opus");
        assert_eq!(cfg.max_concurrent_runs, 2);
        assert_eq!(cfg.retry.max_fix_rounds, 4);
        assert_eq!(cfg.retry.policy, RetryStrategy::DiminishingBugs);
        assert_eq!(cfg.retry.blocking_severity, Severity::High);
        assert_eq!(cfg.retry.retry_schema_violations, 1);
        assert_eq!(cfg.stages.verifier.max_turns, 12);
        assert_eq!(cfg.stages.planner.max_turns, 30);
        assert_eq!(cfg.call_timeout(StageName::Verifier), Duration::from_secs(90));
        assert_eq!(
            cfg.call_timeout(StageName::Fixer),
            Duration::from_secs(cfg.gateway.timeout_secs)
        );
    }

    #[test]
    fn rejects_zero_turn_budget() {
        let mut cfg = PipelineConfig::default();
        cfg.stages.fixer.max_turns = 0;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("stages.fixer.max_turns"));
    }

    #[test]
    fn rejects_zero_batch_concurrency() {
        let mut cfg = PipelineConfig::default();
        cfg.max_concurrent_runs = 0;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("max_concurrent_runs"));
    }

    #[test]
    fn rejects_inverted_classifier_thresholds() {
        let mut cfg = PipelineConfig::default();
        cfg.auto.simple_max_words = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_absolute_artifacts_dir() {
        let mut cfg = PipelineConfig::default();
        cfg.artifacts_dir = "/var/runs".to_string();
        assert!(cfg.validate().is_err());
    }
}
