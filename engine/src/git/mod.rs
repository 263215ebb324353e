//! Optional auto-commit of collection changes
//!
//! Enabled by `system.git.auto_commit` when the project root is a git
//! repository. Failures are logged and never fail the operation that
//! triggered the commit.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GitConfig;
use crate::executor::{BoundedExecutor, CallerIdentity, CommandSpec};
use crate::workflow::templates::TemplateVars;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GitCommitter {
    repo_root: PathBuf,
    message_template: String,
}

impl GitCommitter {
    /// Committer for `repo_root`, or `None` when disabled or not a repository
    pub fn detect(repo_root: &Path, config: &GitConfig) -> Option<Self> {
        if !config.auto_commit {
            return None;
        }
        if !repo_root.join(".git").exists() {
            debug!(
                "auto_commit enabled but {} is not a git repository",
                repo_root.display()
            );
            return None;
        }
        Some(Self {
            repo_root: repo_root.to_path_buf(),
            message_template: config.commit_message_template.clone(),
        })
    }

    pub fn message(&self, action: &str, workflow: &str, collection_id: &str) -> String {
        TemplateVars::new()
            .with("action", action)
            .with("workflow", workflow)
            .with("collection_id", collection_id)
            .render(&self.message_template)
    }

    /// Stage `paths` and commit; returns whether a commit was made
    pub async fn commit(
        &self,
        executor: &BoundedExecutor,
        caller: &CallerIdentity,
        paths: &[PathBuf],
        message: &str,
    ) -> bool {
        let add = CommandSpec::new("git")
            .current_dir(&self.repo_root)
            .args(["add", "-A", "--"])
            .args(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        if let Err(e) = executor.run_checked(caller, &add, Some(GIT_TIMEOUT)).await {
            warn!("git add failed: {}", e);
            return false;
        }

        let commit = CommandSpec::new("git")
            .current_dir(&self.repo_root)
            .args(["commit", "-m", message]);
        match executor.run_checked(caller, &commit, Some(GIT_TIMEOUT)).await {
            Ok(_) => {
                info!("Committed: {}", message);
                true
            }
            Err(e) => {
                warn!("git commit failed: {}", e);
                false
            }
        }
    }
}
