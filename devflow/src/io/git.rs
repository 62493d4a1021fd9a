//! Git adapter for branch and worktree management.
//!
//! Story workspaces only need four operations, so the binding is a narrow trait
//! with a `git` subprocess implementation behind it.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Branch/worktree contract used by the workspace orchestrator.
pub trait Vcs: Send + Sync {
    fn branch_exists(&self, branch: &str) -> Result<bool>;

    /// Create `branch` pointing at `base_ref` without checking it out.
    fn create_branch(&self, branch: &str, base_ref: &str) -> Result<()>;

    /// Attach a new worktree at `path` with `branch` checked out.
    fn create_worktree(&self, branch: &str, path: &Path) -> Result<()>;

    /// Remove the worktree at `path`, discarding uncommitted changes.
    fn remove_worktree(&self, path: &Path) -> Result<()>;
}

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

impl Vcs for Git {
    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    #[instrument(skip(self))]
    fn create_branch(&self, branch: &str, base_ref: &str) -> Result<()> {
        debug!("creating branch");
        self.run_checked(&["branch", branch, base_ref])?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn create_worktree(&self, branch: &str, path: &Path) -> Result<()> {
        debug!("adding worktree");
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", path, branch])?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove_worktree(&self, path: &Path) -> Result<()> {
        debug!("removing worktree");
        let arg = path_arg(path)?;
        self.run_checked(&["worktree", "remove", "--force", arg])?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 worktree path {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn init_repo(root: &Path) {
        let git = Git::new(root);
        git.run_checked(&["init", "-q", "-b", "main"]).expect("init");
        git.run_checked(&["config", "user.email", "dev@example.com"])
            .expect("email");
        git.run_checked(&["config", "user.name", "dev"]).expect("name");
        std::fs::write(root.join("README.md"), "hello\n").expect("write");
        git.run_checked(&["add", "-A"]).expect("add");
        git.run_checked(&["commit", "-q", "-m", "init"]).expect("commit");
    }

    #[test]
    fn branch_and_worktree_lifecycle() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        init_repo(&repo);
        let git = Git::new(&repo);

        assert!(!git.branch_exists("us-1-1").expect("exists"));
        git.create_branch("us-1-1", "main").expect("branch");
        assert!(git.branch_exists("us-1-1").expect("exists"));

        let tree = temp.path().join("trees").join("us-1-1");
        git.create_worktree("us-1-1", &tree).expect("worktree");
        assert!(tree.join("README.md").is_file());

        git.remove_worktree(&tree).expect("remove");
        assert!(!tree.exists());
        assert!(git.branch_exists("us-1-1").expect("branch kept"));
    }

    #[test]
    fn failing_command_reports_stderr() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let err = Git::new(temp.path())
            .create_branch("x", "no-such-ref")
            .expect_err("bad ref");
        assert!(err.to_string().contains("git branch x no-such-ref failed"));
    }
}
