//! Run artifact helpers for `<workspace>/<artifacts_dir>/<task_id>/`.
//!
//! Every gateway call gets its own numbered directory, so retries and repeated
//! verifier/fixer rounds never overwrite each other.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::StageName;

/// Artifact directory for one run.
#[derive(Debug)]
pub struct RunLog {
    dir: PathBuf,
    seq: AtomicU32,
}

impl RunLog {
    /// Create (or reopen) the run directory. Numbering continues after any
    /// call directories left by an earlier run with the same task id.
    pub fn create(artifacts_root: &Path, task_id: &str) -> Result<Self> {
        let dir = artifacts_root.join(task_id);
        fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        let existing = fs::read_dir(&dir)
            .with_context(|| format!("read run dir {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .count();
        Ok(Self {
            dir,
            seq: AtomicU32::new(u32::try_from(existing).unwrap_or(u32::MAX)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn outcome_path(&self) -> PathBuf {
        self.dir.join("outcome.json")
    }

    /// Reserve the next call directory for `stage`.
    pub fn next_call(&self, stage: StageName) -> Result<CallPaths> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let paths = CallPaths::new(&self.dir, n, stage);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create call dir {}", paths.dir.display()))?;
        Ok(paths)
    }

    pub fn write_outcome<T: Serialize>(&self, outcome: &T) -> Result<PathBuf> {
        let path = self.outcome_path();
        write_json(&path, outcome)?;
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct CallPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub stream_path: PathBuf,
    pub gateway_log_path: PathBuf,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
}

impl CallPaths {
    pub fn new(run_dir: &Path, n: u32, stage: StageName) -> Self {
        let dir = run_dir.join(format!("{n:02}-{stage}"));
        Self {
            prompt_path: dir.join("prompt.md"),
            stream_path: dir.join("stream.jsonl"),
            gateway_log_path: dir.join("gateway.log"),
            output_path: dir.join("output.json"),
            error_path: dir.join("error.log"),
            dir,
        }
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        write_text(&self.prompt_path, prompt)
    }

    pub fn write_output<T: Serialize>(&self, output: &T) -> Result<()> {
        write_json(&self.output_path, output)
    }

    pub fn write_error(&self, message: &str) -> Result<()> {
        write_text(&self.error_path, &format!("{message}\n"))
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
