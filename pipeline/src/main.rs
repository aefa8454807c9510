//! Autonomous plan/implement/verify/fix pipeline.
//!
//! `pipeline run` drives one task through its stages against the `claude` CLI
//! and prints the run outcome as JSON. Run artifacts land under
//! `.pipeline/runs/<task_id>/` in the workspace.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pipeline::core::cancel::CancelToken;
use pipeline::core::classifier::classify_task;
use pipeline::core::state::PipelineTask;
use pipeline::core::types::PipelineMode;
use pipeline::exit_codes;
use pipeline::io::claude::ClaudeCliGateway;
use pipeline::io::config::{PipelineConfig, config_path, load_config, write_config};
use pipeline::io::probe::GitProbe;
use pipeline::logging;
use pipeline::orchestrator::{Pipeline, RunOutcome};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Autonomous plan/implement/verify/fix pipeline for code changes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.pipeline/config.toml` with defaults.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one task to completion and print its outcome.
    Run {
        /// What to change.
        #[arg(long)]
        prompt: String,
        /// Working copy to change. Defaults to the current directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
        mode: ModeArg,
        /// Model id. Defaults to `default_model` from config.
        #[arg(long)]
        model: Option<String>,
        /// Path the task is expected to touch. Repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,
        /// Defaults to a random UUID.
        #[arg(long)]
        task_id: Option<String>,
        /// Config file. Defaults to `<workspace>/.pipeline/config.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a JSON array of tasks concurrently and print their outcomes.
    Batch {
        /// File holding `[PipelineTask, ...]`.
        tasks: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the mode `auto` would resolve to.
    Classify {
        #[arg(long)]
        prompt: String,
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Simple,
    Auto,
    Fast,
    Full,
}

impl From<ModeArg> for PipelineMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Simple => PipelineMode::Simple,
            ModeArg::Auto => PipelineMode::Auto,
            ModeArg::Fast => PipelineMode::Fast,
            ModeArg::Full => PipelineMode::Full,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            prompt,
            workspace,
            mode,
            model,
            targets,
            task_id,
            config,
        } => {
            let workspace = resolve_workspace(workspace)?;
            let config = load_for(config.as_deref(), &workspace)?;
            let task = PipelineTask {
                task_id: task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                original_prompt: prompt,
                workspace_path: workspace,
                target_paths: targets,
                model: model.unwrap_or_else(|| config.default_model.clone()),
                pipeline_mode: mode.into(),
                enriched_prompt: None,
            };
            cmd_run(task, &config)
        }
        Command::Batch { tasks, config } => {
            let cwd = resolve_workspace(None)?;
            let config = load_for(config.as_deref(), &cwd)?;
            cmd_batch(&tasks, &config)
        }
        Command::Classify {
            prompt,
            targets,
            config,
        } => {
            let cwd = resolve_workspace(None)?;
            let config = load_for(config.as_deref(), &cwd)?;
            println!("{}", classify_task(&prompt, &targets, &config.auto).as_str());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let cwd = resolve_workspace(None)?;
    let path = config_path(&cwd);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &PipelineConfig::default())?;
    info!(path = %path.display(), "wrote default config");
    Ok(exit_codes::OK)
}

fn cmd_run(task: PipelineTask, config: &PipelineConfig) -> Result<i32> {
    let gateway = ClaudeCliGateway::new(&config.gateway.binary);
    let pipeline = Pipeline::new(&gateway, GitProbe, config);
    let outcome = pipeline.run(task, CancelToken::new())?;
    print_json(&outcome)?;
    Ok(exit_code_for(&outcome))
}

fn cmd_batch(tasks_path: &Path, config: &PipelineConfig) -> Result<i32> {
    let raw = fs::read_to_string(tasks_path)
        .with_context(|| format!("read {}", tasks_path.display()))?;
    let tasks: Vec<PipelineTask> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", tasks_path.display()))?;

    let gateway = ClaudeCliGateway::new(&config.gateway.binary);
    let pipeline = Pipeline::new(&gateway, GitProbe, config);
    let results = pipeline.run_batch(tasks, &CancelToken::new())?;

    let mut code = exit_codes::OK;
    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(outcome) => {
                if exit_code_for(&outcome) != exit_codes::OK && code == exit_codes::OK {
                    code = exit_codes::FAILED;
                }
                outcomes.push(outcome);
            }
            Err(err) => {
                eprintln!("{:#}", err);
                code = exit_codes::INVALID;
            }
        }
    }
    print_json(&outcomes)?;
    Ok(code)
}

fn exit_code_for(outcome: &RunOutcome) -> i32 {
    if outcome.status.is_done() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    }
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf> {
    let path = match workspace {
        Some(path) => path,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    fs::canonicalize(&path).with_context(|| format!("resolve workspace {}", path.display()))
}

fn load_for(explicit: Option<&Path>, workspace: &Path) -> Result<PipelineConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => load_config(&config_path(workspace)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize outcome")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["pipeline", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["pipeline", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_defaults_to_auto() {
        let cli = Cli::parse_from(["pipeline", "run", "--prompt", "fix typo"]);
        match cli.command {
            Command::Run {
                prompt,
                mode,
                targets,
                task_id,
                ..
            } => {
                assert_eq!(prompt, "fix typo");
                assert_eq!(mode, ModeArg::Auto);
                assert!(targets.is_empty());
                assert!(task_id.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_with_targets_and_mode() {
        let cli = Cli::parse_from([
            "pipeline", "run", "--prompt", "split", "--mode", "full", "--target", "a.rs",
            "--target", "b.rs",
        ]);
        match cli.command {
            Command::Run { mode, targets, .. } => {
                assert_eq!(PipelineMode::from(mode), PipelineMode::Full);
                assert_eq!(targets, vec!["a.rs", "b.rs"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["pipeline", "run", "--prompt", "x", "--mode", "turbo"]).is_err());
    }
}
