//! Fetch-if-absent source checkouts.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::HarnessError;
use crate::process::{Cmd, CommandRunner};

/// A source checkout the build needs.
///
/// Only the existence of `dir` is consulted: there is no pinning and no
/// content verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    /// Clone URL.
    pub url: String,
    /// Workspace-relative checkout directory.
    pub dir: PathBuf,
}

impl Dependency {
    pub fn local_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.dir)
    }
}

/// Whether [`DependencyFetcher::ensure_fetched`] had to clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    AlreadyPresent,
    Cloned,
}

pub struct DependencyFetcher<'a> {
    workspace: &'a Path,
    runner: &'a dyn CommandRunner,
}

impl<'a> DependencyFetcher<'a> {
    pub fn new(workspace: &'a Path, runner: &'a dyn CommandRunner) -> Self {
        Self { workspace, runner }
    }

    /// Clone `dep` unless its directory already exists.
    ///
    /// A failed clone may leave a partial directory behind; it is not
    /// removed, and its presence will satisfy the next call. Run `clean`
    /// before retrying.
    pub fn ensure_fetched(&self, dep: &Dependency) -> Result<FetchOutcome, HarnessError> {
        let path = dep.local_path(self.workspace);
        if path.exists() {
            debug!(dependency = %dep.name, path = %path.display(), "already present");
            return Ok(FetchOutcome::AlreadyPresent);
        }

        info!(dependency = %dep.name, "cloning {}", dep.url);
        let clone = Cmd::new("git")
            .arg("clone")
            .arg(dep.url.as_str())
            .arg(dep.dir.to_string_lossy())
            .current_dir(self.workspace);
        self.runner
            .run(&clone)
            .map_err(|source| HarnessError::DependencyFetchFailed {
                name: dep.name.clone(),
                source: Box::new(source),
            })?;
        Ok(FetchOutcome::Cloned)
    }

    /// Ensure every dependency in order, stopping at the first failure.
    pub fn ensure_all(&self, deps: &[Dependency]) -> Result<usize, HarnessError> {
        let mut cloned = 0;
        for dep in deps {
            if self.ensure_fetched(dep)? == FetchOutcome::Cloned {
                cloned += 1;
            }
        }
        Ok(cloned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeRunner;
    use std::fs;
    use tempfile::TempDir;

    fn dep(name: &str) -> Dependency {
        Dependency {
            name: name.to_string(),
            url: format!("https://example.invalid/{name}.git"),
            dir: PathBuf::from(name),
        }
    }

    /// Fake whose `git clone` creates the target directory like the real one.
    fn cloning_runner(workspace: &Path) -> FakeRunner {
        let workspace = workspace.to_path_buf();
        FakeRunner::new().on_success("git clone", move |cmd| {
            let target = cmd.get_args().last().unwrap();
            fs::create_dir_all(workspace.join(target)).unwrap();
        })
    }

    #[test]
    fn existing_directory_is_never_refetched() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("tiny-AES-c")).unwrap();
        let runner = FakeRunner::new();

        let outcome = DependencyFetcher::new(temp.path(), &runner)
            .ensure_fetched(&dep("tiny-AES-c"))
            .unwrap();

        assert_eq!(outcome, FetchOutcome::AlreadyPresent);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn fresh_workspace_clones_each_library_once() {
        let temp = TempDir::new().unwrap();
        let runner = cloning_runner(temp.path());
        let fetcher = DependencyFetcher::new(temp.path(), &runner);
        let deps = [dep("tiny-AES-CMAC-c"), dep("tiny-AES-c")];

        assert_eq!(fetcher.ensure_all(&deps).unwrap(), 2);
        assert_eq!(runner.count_matching("git clone"), 2);

        assert_eq!(fetcher.ensure_all(&deps).unwrap(), 0);
        assert_eq!(runner.count_matching("git clone"), 2);
    }

    #[test]
    fn clone_runs_in_workspace_root() {
        let temp = TempDir::new().unwrap();
        let runner = cloning_runner(temp.path());
        DependencyFetcher::new(temp.path(), &runner)
            .ensure_fetched(&dep("tiny-AES-c"))
            .unwrap();

        let call = &runner.calls()[0];
        assert_eq!(
            call.command,
            "git clone https://example.invalid/tiny-AES-c.git tiny-AES-c"
        );
        assert_eq!(call.cwd.as_deref(), Some(temp.path()));
    }

    #[test]
    fn clone_failure_names_the_dependency() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new().exit_with("git clone", 128);

        let err = DependencyFetcher::new(temp.path(), &runner)
            .ensure_all(&[dep("tiny-AES-CMAC-c"), dep("tiny-AES-c")])
            .unwrap_err();

        match &err {
            HarnessError::DependencyFetchFailed { name, .. } => {
                assert_eq!(name, "tiny-AES-CMAC-c")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), 128);
        assert_eq!(runner.count_matching("git clone"), 1);
    }
}
