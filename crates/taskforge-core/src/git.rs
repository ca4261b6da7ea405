//! Git Driver: `worktree add`, `worktree remove`, `branch -D`,
//! `worktree prune`, and `merge --no-ff`, wrapped with structured outcomes.
//!
//! Every invocation forces `LC_ALL=C`/`LANG=C` so the merge-conflict
//! substring classification below is not locale-sensitive.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::warn;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Outcome of `merge_branch`.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflict: bool,
    pub output: String,
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        cmd.env("LC_ALL", "C");
        cmd.env("LANG", "C");

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// `git -C repo worktree add -B branch worktree_path` — creates or
    /// resets `branch` at HEAD.
    pub fn create_worktree(&self, worktree_path: &str, branch: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "add", "-B", branch, worktree_path],
        )?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add -B {branch} {worktree_path} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Best-effort `worktree remove --force`, then `branch -D`, then
    /// `worktree prune`. Secondary failures are swallowed; primary
    /// failure (the `worktree remove`) propagates.
    pub fn remove_worktree(&self, worktree_path: &str, branch: &str) -> Result<()> {
        let remove = self.exec(
            &self.repo_path,
            &["worktree", "remove", "--force", worktree_path],
        )?;
        if !remove.success() {
            return Err(anyhow!(
                "git worktree remove --force {worktree_path} failed: {}",
                remove.combined_output()
            ));
        }

        if let Ok(delete) = self.exec(&self.repo_path, &["branch", "-D", branch]) {
            if !delete.success() {
                warn!(
                    "git branch -D {branch} failed (ignored): {}",
                    delete.combined_output()
                );
            }
        }

        if let Ok(prune) = self.exec(&self.repo_path, &["worktree", "prune"]) {
            if !prune.success() {
                warn!(
                    "git worktree prune failed (ignored): {}",
                    prune.combined_output()
                );
            }
        }

        Ok(())
    }

    /// `git merge --no-ff branch`. On non-zero exit, classifies by
    /// searching combined output for "conflict" or "automatic merge
    /// failed" (case-insensitive). On conflict, issues `git merge --abort`
    /// (best-effort) before returning.
    pub fn merge_branch(&self, branch: &str) -> Result<MergeOutcome> {
        let result = self.exec(&self.repo_path, &["merge", "--no-ff", branch])?;
        if result.success() {
            return Ok(MergeOutcome {
                success: true,
                conflict: false,
                output: result.combined_output(),
            });
        }

        let output = result.combined_output();
        let lowered = output.to_lowercase();
        let conflict = lowered.contains("conflict") || lowered.contains("automatic merge failed");

        if conflict {
            if let Ok(abort) = self.exec(&self.repo_path, &["merge", "--abort"]) {
                if !abort.success() {
                    warn!(
                        "git merge --abort failed (ignored): {}",
                        abort.combined_output()
                    );
                }
            }
        }

        Ok(MergeOutcome {
            success: false,
            conflict,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(args)
                .env("LC_ALL", "C")
                .status()
                .expect("spawn git");
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello\n").expect("write README");
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
    }

    #[test]
    fn create_then_remove_worktree_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_repo(tmp.path());
        let git = Git::new(tmp.path().to_string_lossy().into_owned());
        let worktree_path = tmp.path().join("wt-task-1");
        let worktree_path = worktree_path.to_string_lossy().into_owned();

        git.create_worktree(&worktree_path, "task/1")
            .expect("create_worktree");
        assert!(std::path::Path::new(&worktree_path).exists());

        git.remove_worktree(&worktree_path, "task/1")
            .expect("remove_worktree");
        assert!(!std::path::Path::new(&worktree_path).exists());
    }

    #[test]
    fn merge_branch_detects_conflict() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_repo(tmp.path());
        let git = Git::new(tmp.path().to_string_lossy().into_owned());

        let run = |args: &[&str]| {
            Command::new("git")
                .arg("-C")
                .arg(tmp.path())
                .args(args)
                .env("LC_ALL", "C")
                .status()
                .expect("spawn git")
        };

        run(&["checkout", "-b", "feature"]);
        std::fs::write(tmp.path().join("README.md"), "feature change\n").expect("write");
        run(&["commit", "-aqm", "feature change"]);

        run(&["checkout", "main"]);
        // main might not exist if default branch is "master"; fall back.
        let on_main = run(&["rev-parse", "--verify", "main"]).success();
        let base_branch = if on_main { "main" } else { "master" };
        run(&["checkout", base_branch]);
        std::fs::write(tmp.path().join("README.md"), "base change\n").expect("write");
        run(&["commit", "-aqm", "base change"]);

        let outcome = git.merge_branch("feature").expect("merge_branch");
        assert!(!outcome.success);
        assert!(outcome.conflict, "expected conflict, got: {}", outcome.output);
    }
}
