//! Low-level git operations and wrappers.
//!
//! This module provides the fixed vocabulary of git commands the engine is
//! allowed to issue, without dependencies on the dag, config, or executor
//! modules. Every invocation runs in an explicit working directory; nothing
//! here touches the process-wide current directory.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// Outcome of a raw git invocation: exit code plus combined stdout/stderr.
#[derive(Debug)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output for error messages; stderr first since git puts
    /// diagnostics there.
    pub fn combined(&self) -> String {
        let mut out = self.stderr.trim().to_string();
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(stdout);
        }
        out
    }
}

/// Run a git command in the given directory and capture its output.
pub fn git_in(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("Failed to run git {} in {}", args.join(" "), dir.display()))?;

    Ok(GitOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a git command in the given directory and return stdout on success.
///
/// # Errors
///
/// Returns an error if the command fails to execute or exits non-zero.
fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = git_in(dir, args)?;
    if !out.success() {
        anyhow::bail!("git {} failed: {}", args.join(" "), out.combined());
    }
    Ok(out.stdout)
}

/// Get the current branch name.
/// Returns "HEAD" for a detached HEAD state.
pub fn current_branch(dir: &Path) -> Result<String> {
    let branch = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(branch.trim().to_string())
}

/// Check if a local branch exists.
pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let out = git_in(
        dir,
        &["show-ref", "--verify", &format!("refs/heads/{}", branch)],
    )?;
    Ok(out.success())
}

/// Create a branch pointing at the given start point. The branch must not
/// already exist.
pub fn create_branch_from(dir: &Path, branch: &str, start_point: &str) -> Result<()> {
    run_git(dir, &["branch", branch, start_point])
        .with_context(|| format!("Failed to create branch {} from {}", branch, start_point))?;
    Ok(())
}

/// Checkout an existing branch.
pub fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["checkout", branch])
        .with_context(|| format!("Failed to checkout {}", branch))?;
    Ok(())
}

/// Delete a local branch. `force` uses -D (delete even if unmerged).
pub fn delete_branch(dir: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    run_git(dir, &["branch", flag, branch])
        .with_context(|| format!("Failed to delete branch {}", branch))?;
    Ok(())
}

/// Current HEAD commit SHA (full 40-hex).
pub fn head_sha(dir: &Path) -> Result<String> {
    let sha = run_git(dir, &["rev-parse", "HEAD"])?;
    Ok(sha.trim().to_string())
}

/// Count commits on `branch` that are not on `base` (`base..branch`).
pub fn commits_ahead(dir: &Path, base: &str, branch: &str) -> Result<u32> {
    let out = run_git(
        dir,
        &["rev-list", "--count", &format!("{}..{}", base, branch)],
    )?;
    out.trim()
        .parse()
        .with_context(|| format!("Unexpected rev-list output: {}", out.trim()))
}

/// Check whether the working tree has uncommitted changes (staged, unstaged,
/// or untracked).
pub fn has_uncommitted_changes(dir: &Path) -> Result<bool> {
    let out = run_git(dir, &["status", "--porcelain"])?;
    Ok(!out.trim().is_empty())
}

/// Result of a merge attempt.
#[derive(Debug)]
pub struct MergeOutcome {
    pub success: bool,
    /// Paths with unresolved conflicts when the merge failed.
    pub conflicts: Vec<String>,
    /// Raw git output for diagnostics.
    pub output: String,
}

/// Merge `branch` into the currently checked-out branch with --no-ff and a
/// fixed message.
///
/// On conflict the working copy is left in the unresolved state (MERGE_HEAD
/// present) so a human or an agent can finish or abort the merge; conflicted
/// paths are enumerated in the result.
pub fn merge_no_ff(dir: &Path, branch: &str, message: &str) -> Result<MergeOutcome> {
    let out = git_in(dir, &["merge", "--no-ff", branch, "-m", message])?;

    if out.success() {
        return Ok(MergeOutcome {
            success: true,
            conflicts: vec![],
            output: out.combined(),
        });
    }

    let conflicts = conflicting_paths(dir).unwrap_or_default();
    Ok(MergeOutcome {
        success: false,
        conflicts,
        output: out.combined(),
    })
}

/// Abort an in-progress merge, restoring a clean working copy.
pub fn merge_abort(dir: &Path) -> Result<()> {
    run_git(dir, &["merge", "--abort"]).context("Failed to abort merge")?;
    Ok(())
}

/// List paths with unresolved merge conflicts (the "both modified" set).
pub fn conflicting_paths(dir: &Path) -> Result<Vec<String>> {
    let out = run_git(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(out
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Check whether the repository has an in-progress merge (MERGE_HEAD present).
pub fn merge_in_progress(dir: &Path) -> Result<bool> {
    let out = run_git(dir, &["rev-parse", "--git-dir"])?;
    let git_dir = dir.join(out.trim());
    Ok(git_dir.join("MERGE_HEAD").exists())
}

/// Resolve the repository's top-level directory for a path inside it.
pub fn repo_root(dir: &Path) -> Result<std::path::PathBuf> {
    let out = run_git(dir, &["rev-parse", "--show-toplevel"])?;
    Ok(std::path::PathBuf::from(out.trim()))
}
