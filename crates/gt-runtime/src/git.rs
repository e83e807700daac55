use std::path::{Path, PathBuf};
use std::process::Stdio;

use gt_core::errors::GtError;
use tokio::process::Command;

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// All git access goes through explicit invocations against an explicit
/// repository directory; exit code and output are always captured.
#[derive(Debug, Clone)]
pub struct Git {
    repo: PathBuf,
}

impl Git {
    pub fn at(repo: impl Into<PathBuf>) -> Self {
        Git { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn run_in(dir: &Path, args: &[&str]) -> Result<GitOutput, GtError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GtError::Git {
                op: args.first().unwrap_or(&"git").to_string(),
                code: -1,
                stderr: format!("failed to run git: {e}"),
            })?;
        Ok(GitOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GtError> {
        Self::run_in(&self.repo, args).await
    }

    /// Run and demand success, mapping failure to a kind-tagged error.
    async fn run_ok(&self, args: &[&str]) -> Result<GitOutput, GtError> {
        let out = self.run(args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(GtError::Git {
                op: args.first().unwrap_or(&"git").to_string(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    pub async fn clone_into(url: &str, dest: &Path) -> Result<(), GtError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let parent = dest.parent().unwrap_or(Path::new("."));
        let dest_str = dest.to_string_lossy().into_owned();
        let out = Self::run_in(parent, &["clone", url, &dest_str]).await?;
        if out.success() {
            Ok(())
        } else {
            Err(GtError::Git {
                op: "clone".into(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    pub async fn fetch(&self, remote: &str) -> Result<(), GtError> {
        self.run_ok(&["fetch", "--prune", remote]).await?;
        Ok(())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GtError> {
        let reference = format!("refs/heads/{branch}");
        let out = self
            .run(&["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.success())
    }

    pub async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, GtError> {
        let reference = format!("refs/remotes/{remote}/{branch}");
        let out = self
            .run(&["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.success())
    }

    pub async fn checkout(&self, branch: &str) -> Result<(), GtError> {
        self.run_ok(&["checkout", branch]).await?;
        Ok(())
    }

    pub async fn checkout_new(&self, branch: &str, start_point: &str) -> Result<(), GtError> {
        self.run_ok(&["checkout", "-B", branch, start_point]).await?;
        Ok(())
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, start_point: &str) -> Result<(), GtError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().into_owned();
        self.run_ok(&["worktree", "add", "-B", branch, &path_str, start_point])
            .await?;
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GtError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_ok(&args).await?;
        Ok(())
    }

    /// Rebase HEAD onto `onto`. Conflicts are a normal flow here, not a
    /// caller-facing error kind to wrap further: the rebase is aborted
    /// and `GtError::GitConflict` carries the first conflicting output.
    pub async fn rebase(&self, onto: &str) -> Result<(), GtError> {
        let out = self.run(&["rebase", onto]).await?;
        if out.success() {
            return Ok(());
        }
        let combined = format!("{}\n{}", out.stdout, out.stderr);
        let _ = self.run(&["rebase", "--abort"]).await;
        if is_conflict_output(&combined) {
            Err(GtError::GitConflict {
                branch: onto.to_string(),
                detail: first_conflict_line(&combined),
            })
        } else {
            Err(GtError::Git {
                op: "rebase".into(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Fast-forward-only merge; refuses to create a merge commit.
    pub async fn merge_ff_only(&self, branch: &str) -> Result<(), GtError> {
        self.run_ok(&["merge", "--ff-only", branch]).await?;
        Ok(())
    }

    pub async fn merge_squash(&self, branch: &str, message: &str) -> Result<(), GtError> {
        self.run_ok(&["merge", "--squash", branch]).await?;
        self.run_ok(&["commit", "-m", message]).await?;
        Ok(())
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<(), GtError> {
        self.run_ok(&["push", remote, branch]).await?;
        Ok(())
    }

    pub async fn push_delete(&self, remote: &str, branch: &str) -> Result<(), GtError> {
        self.run_ok(&["push", remote, "--delete", branch]).await?;
        Ok(())
    }

    /// Push, then re-fetch the remote ref and verify it landed at the
    /// expected SHA. Silent push failures must be impossible; a mismatch
    /// is fatal for the caller's cycle and is never retried here.
    pub async fn push_verify_sha(
        &self,
        remote: &str,
        branch: &str,
        expected_sha: &str,
    ) -> Result<(), GtError> {
        self.push(remote, branch).await?;
        self.fetch(remote).await?;
        let remote_ref = format!("refs/remotes/{remote}/{branch}");
        let actual = self.rev_parse(&remote_ref).await?;
        if actual != expected_sha {
            return Err(GtError::GitPushMismatch {
                branch: branch.to_string(),
                local: expected_sha.to_string(),
                remote: actual,
            });
        }
        Ok(())
    }

    /// Whether `ancestor` is an ancestor of `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GtError> {
        let out = self
            .run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(out.success())
    }

    pub async fn status_porcelain(&self) -> Result<String, GtError> {
        Ok(self.run_ok(&["status", "--porcelain"]).await?.stdout)
    }

    pub async fn stash_count(&self) -> Result<usize, GtError> {
        let out = self.run_ok(&["stash", "list"]).await?;
        Ok(out.stdout.lines().filter(|l| !l.trim().is_empty()).count())
    }

    pub async fn head_sha(&self) -> Result<String, GtError> {
        self.rev_parse("HEAD").await
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String, GtError> {
        let out = self.run_ok(&["rev-parse", rev]).await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<(), GtError> {
        self.run_ok(&["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Default branch of a remote, from its HEAD symref; falls back to
    /// `main`.
    pub async fn default_branch(&self, remote: &str) -> Result<String, GtError> {
        let reference = format!("refs/remotes/{remote}/HEAD");
        let out = self
            .run(&["symbolic-ref", "--short", &reference])
            .await?;
        if out.success() {
            let full = out.stdout.trim();
            return Ok(full
                .strip_prefix(&format!("{remote}/"))
                .unwrap_or(full)
                .to_string());
        }
        Ok("main".into())
    }

    pub async fn remotes(&self) -> Result<Vec<String>, GtError> {
        let out = self.run_ok(&["remote"]).await?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Conflict detection is a side-effect of the rebase itself, not a
/// pre-flight: a pre-flight can disagree with the real rebase under
/// concurrent remote updates.
fn is_conflict_output(output: &str) -> bool {
    output.contains("CONFLICT")
        || output.contains("could not apply")
        || output.contains("Merge conflict in")
}

fn first_conflict_line(output: &str) -> String {
    output
        .lines()
        .find(|l| l.contains("CONFLICT") || l.contains("could not apply"))
        .unwrap_or("rebase conflict")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_pattern_matching() {
        assert!(is_conflict_output(
            "Auto-merging src/lib.rs\nCONFLICT (content): Merge conflict in src/lib.rs"
        ));
        assert!(is_conflict_output(
            "error: could not apply abc1234... fix things"
        ));
        assert!(!is_conflict_output("fatal: invalid upstream 'nope'"));
    }

    #[test]
    fn first_conflict_line_extraction() {
        let out = "Auto-merging a\nCONFLICT (content): Merge conflict in a\nerror: ...";
        assert_eq!(
            first_conflict_line(out),
            "CONFLICT (content): Merge conflict in a"
        );
    }

    #[tokio::test]
    async fn run_captures_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::at(dir.path());
        // Not a repository: nonzero exit, stderr captured, no panic.
        let out = git.run(&["status", "--porcelain"]).await.unwrap();
        assert_ne!(out.code, 0);
        assert!(!out.stderr.is_empty());
    }

    #[tokio::test]
    async fn init_commit_and_head_sha() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::at(dir.path());
        git.run_ok(&["init", "-b", "main"]).await.unwrap();
        git.run_ok(&["config", "user.email", "gt@test"]).await.unwrap();
        git.run_ok(&["config", "user.name", "gt"]).await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        git.run_ok(&["add", "."]).await.unwrap();
        git.run_ok(&["commit", "-m", "init"]).await.unwrap();

        let sha = git.head_sha().await.unwrap();
        assert_eq!(sha.len(), 40);
        assert!(git.branch_exists("main").await.unwrap());
        assert!(!git.branch_exists("nope").await.unwrap());
        assert!(git.is_ancestor(&sha, "HEAD").await.unwrap());
    }
}
