//! Workspace provisioning: one git worktree per agent.
//!
//! Worktrees share the object store of the main repository but have
//! independent working directories, which gives each agent filesystem
//! isolation without a full clone. The hub only talks to the
//! [`WorkspaceProvisioner`] trait; the git binding lives behind it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Errors from workspace provisioning.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The repository path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("failed to run {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited non-zero.
    #[error("{command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The target path already exists with a different branch checked out.
    #[error("worktree at {path} has branch {found:?}, expected {expected}")]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// Creates and removes isolated agent workspaces.
///
/// Both operations must be safe to call twice: a second `create_worktree`
/// for the same branch/path returns success, and removing a missing
/// worktree is a no-op.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Materialize a worktree for `branch` (creating the branch off the
    /// current HEAD when it does not exist yet) at `path`.
    async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
    ) -> Result<(), WorkspaceError>;

    /// Remove the worktree at `path` and prune its registration.
    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn WorkspaceProvisioner) {}
};

/// Git-backed [`WorkspaceProvisioner`].
///
/// Git does not support concurrent worktree mutation on one repository
/// (it locks the shared object store), so all mutating operations are
/// serialized through an internal mutex.
#[derive(Debug)]
pub struct GitWorkspaceProvisioner {
    repo_path: PathBuf,
    git_lock: Mutex<()>,
}

impl GitWorkspaceProvisioner {
    /// Create a provisioner rooted at `repo_path`.
    pub async fn new(repo_path: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let repo_path = repo_path.into();
        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .await
            .map_err(|e| WorkspaceError::Exec {
                command: "git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorkspaceError::NotAGitRepo(repo_path));
        }
        Ok(Self {
            repo_path,
            git_lock: Mutex::new(()),
        })
    }

    async fn git(&self, args: &[&str], cwd: &Path) -> Result<String, WorkspaceError> {
        let command = format!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| WorkspaceError::Exec {
                command: command.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorkspaceError::GitExit {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let reference = format!("refs/heads/{branch}");
        match self
            .git(&["rev-parse", "--verify", "--quiet", &reference], &self.repo_path)
            .await
        {
            Ok(_) => Ok(true),
            Err(WorkspaceError::GitExit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Branch currently checked out at `path`, if the path is a worktree.
    async fn branch_at(&self, path: &Path) -> Option<String> {
        self.git(&["branch", "--show-current"], path).await.ok()
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitWorkspaceProvisioner {
    async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
    ) -> Result<(), WorkspaceError> {
        let _guard = self.git_lock.lock().await;

        if path.exists() {
            // Idempotent when the existing worktree already has our branch.
            match self.branch_at(path).await {
                Some(found) if found == branch => {
                    tracing::info!(path = %path.display(), branch, "worktree already exists");
                    return Ok(());
                }
                Some(found) => {
                    return Err(WorkspaceError::BranchMismatch {
                        path: path.to_path_buf(),
                        expected: branch.to_string(),
                        found,
                    });
                }
                None => {
                    return Err(WorkspaceError::BranchMismatch {
                        path: path.to_path_buf(),
                        expected: branch.to_string(),
                        found: "<not a worktree>".to_string(),
                    });
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::Exec {
                command: format!("mkdir -p {}", parent.display()),
                source: e,
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        if self.branch_exists(branch).await? {
            self.git(&["worktree", "add", &path_str, branch], repo).await?;
        } else {
            self.git(&["worktree", "add", "-b", branch, &path_str], repo)
                .await?;
        }

        tracing::info!(path = %path.display(), branch, "worktree created");
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError> {
        let _guard = self.git_lock.lock().await;

        if !path.exists() {
            // Prune any stale registration and call it done.
            let _ = self.git(&["worktree", "prune"], &self.repo_path).await;
            return Ok(());
        }

        let path_str = path.to_string_lossy().to_string();
        self.git(
            &["worktree", "remove", "--force", &path_str],
            &self.repo_path,
        )
        .await?;

        tracing::info!(path = %path.display(), "worktree removed");
        Ok(())
    }
}

/// Filesystem-safe directory name for a branch (`/` becomes `--`).
pub fn worktree_dir_name(branch: &str) -> String {
    branch.replace('/', "--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let output = StdCommand::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .expect("git should run");
            assert!(
                output.status.success(),
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        };
        run(&["init"]);
        run(&["config", "user.email", "test@apiary.dev"]);
        run(&["config", "user.name", "Apiary Test"]);
        std::fs::write(dir.join("README.md"), "# fixture\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial"]);
    }

    #[test]
    fn dir_name_replaces_slashes() {
        assert_eq!(worktree_dir_name("apiary/drone-1"), "apiary--drone-1");
        assert_eq!(worktree_dir_name("plain"), "plain");
    }

    #[tokio::test]
    async fn create_is_idempotent_and_makes_branch() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        let provisioner = GitWorkspaceProvisioner::new(&repo).await.unwrap();
        let wt = tmp.path().join("worktrees").join("apiary--drone-1");

        provisioner
            .create_worktree(&repo, "apiary/drone-1", &wt)
            .await
            .unwrap();
        assert!(wt.join("README.md").exists());

        // Second call with the same branch succeeds without touching git.
        provisioner
            .create_worktree(&repo, "apiary/drone-1", &wt)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mismatched_branch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        let provisioner = GitWorkspaceProvisioner::new(&repo).await.unwrap();
        let wt = tmp.path().join("wt");
        provisioner
            .create_worktree(&repo, "apiary/a", &wt)
            .await
            .unwrap();

        let err = provisioner
            .create_worktree(&repo, "apiary/b", &wt)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::BranchMismatch { .. }));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        let provisioner = GitWorkspaceProvisioner::new(&repo).await.unwrap();
        let wt = tmp.path().join("wt");
        provisioner
            .create_worktree(&repo, "apiary/x", &wt)
            .await
            .unwrap();

        provisioner.remove_worktree(&wt).await.unwrap();
        assert!(!wt.exists());
        provisioner.remove_worktree(&wt).await.unwrap();
    }

    #[tokio::test]
    async fn non_repo_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = GitWorkspaceProvisioner::new(tmp.path()).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NotAGitRepo(_)));
    }
}
