//! Workspace/VCS probe: where does the repository holding the touched files live?

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::io::git::Git;

/// Locates a repository root. Injected into the verifier so tests can stub it.
pub trait RepoProbe {
    /// Repository root for the first candidate that lives in one, if any.
    ///
    /// Candidates are paths relative to `workspace` (absolute paths are also
    /// accepted). With no candidates, the workspace itself is probed.
    fn find_repository_root(&self, workspace: &Path, candidates: &[String]) -> Option<PathBuf>;
}

impl<P: RepoProbe + ?Sized> RepoProbe for &P {
    fn find_repository_root(&self, workspace: &Path, candidates: &[String]) -> Option<PathBuf> {
        (**self).find_repository_root(workspace, candidates)
    }
}

/// Probe backed by `git rev-parse --show-toplevel`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitProbe;

impl RepoProbe for GitProbe {
    fn find_repository_root(&self, workspace: &Path, candidates: &[String]) -> Option<PathBuf> {
        let mut dirs: Vec<PathBuf> = candidates
            .iter()
            .filter_map(|file| nearest_existing_dir(&workspace.join(file)))
            .collect();
        if dirs.is_empty() {
            dirs.push(workspace.to_path_buf());
        }
        dirs.dedup();

        for dir in dirs {
            match Git::new(&dir).toplevel() {
                Ok(Some(root)) => return Some(root),
                Ok(None) => {}
                Err(err) => warn!(dir = %dir.display(), err = %format!("{err:#}"), "git probe failed"),
            }
        }
        debug!(workspace = %workspace.display(), "no repository root found");
        None
    }
}

/// Closest existing directory at or above `path`. Deleted files still resolve.
fn nearest_existing_dir(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|candidate| candidate.is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    /// Verifies the root of an initialized repository is found from a nested file.
    #[test]
    fn finds_root_from_nested_candidate() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(repo.join("src/deep")).expect("mkdir");
        Git::new(&repo).init().expect("git init");

        let root = GitProbe
            .find_repository_root(temp.path(), &["repo/src/deep/x.ts".to_string()])
            .expect("root");
        let expected = fs::canonicalize(&repo).expect("canonicalize");
        assert_eq!(fs::canonicalize(root).expect("canonicalize"), expected);
    }

    /// Verifies a workspace with no repository yields `None`.
    #[test]
    fn returns_none_outside_repository() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        // tempdirs normally live outside any repository; skip when they do not.
        if Git::new(temp.path()).toplevel().ok().flatten().is_some() {
            return;
        }
        fs::write(temp.path().join("a.txt"), "a").expect("write");
        assert_eq!(
            GitProbe.find_repository_root(temp.path(), &["a.txt".to_string()]),
            None
        );
    }

    #[test]
    fn nearest_dir_walks_up_from_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("gone/also-gone/file.rs");
        assert_eq!(
            nearest_existing_dir(&missing).as_deref(),
            Some(temp.path())
        );
    }
}
