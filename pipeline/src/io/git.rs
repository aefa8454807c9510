//! Git adapter for workspace probing.
//!
//! A small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Top-level directory of the repository containing `workdir`.
    ///
    /// Returns `Ok(None)` when `workdir` is not inside a work tree.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn toplevel(&self) -> Result<Option<PathBuf>> {
        let output = self.run(&["rev-parse", "--show-toplevel"])?;
        if !output.status.success() {
            debug!("not inside a git work tree");
            return Ok(None);
        }
        let out = String::from_utf8_lossy(&output.stdout);
        let root = out.trim();
        if root.is_empty() {
            return Err(anyhow!("git rev-parse --show-toplevel printed nothing"));
        }
        debug!(root, "found repository root");
        Ok(Some(PathBuf::from(root)))
    }

    /// Initialize a repository in `workdir`.
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "--quiet"])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
