//! Isolated git worktree operations.
//!
//! Each running spec gets its own worktree rooted under the worktree root,
//! on a branch created from the layer's start point. Creation is idempotent:
//! an existing worktree of the same name pointing at a valid path is reused.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::git_ops;

/// A materialized worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub name: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Worktree name for a spec: `dag-<dag_id>-<spec_id>`.
pub fn worktree_name(dag_id: &str, spec_id: &str) -> String {
    format!("dag-{}-{}", dag_id, spec_id)
}

/// Canonical branch name for a spec: `dag/<dag_id>/<spec_id>`.
pub fn spec_branch(dag_id: &str, spec_id: &str) -> String {
    format!("dag/{}/{}", dag_id, spec_id)
}

/// 4-hex collision suffix derived from the definition file's path.
pub fn collision_suffix(definition_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    definition_path.hash(&mut hasher);
    format!("{:04x}", hasher.finish() & 0xffff)
}

/// Worktree adapter bound to one repository.
#[derive(Debug, Clone)]
pub struct Worktrees {
    repo_root: PathBuf,
    worktree_root: PathBuf,
}

impl Worktrees {
    pub fn new(repo_root: impl Into<PathBuf>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_root: worktree_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Default path for a named worktree.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.worktree_root.join(name)
    }

    /// Resolve the branch to use for a spec.
    ///
    /// The canonical name is used unless a foreign branch already occupies
    /// it, in which case a 4-hex suffix derived from the definition path is
    /// appended. The result must be persisted so resume reuses it.
    pub fn resolve_branch(
        &self,
        dag_id: &str,
        spec_id: &str,
        definition_path: &Path,
    ) -> Result<String> {
        let canonical = spec_branch(dag_id, spec_id);
        if !git_ops::branch_exists(&self.repo_root, &canonical)? {
            return Ok(canonical);
        }
        // The canonical branch exists but no worktree of ours points at it:
        // treat it as a foreign branch and step aside.
        if self.get(&worktree_name(dag_id, spec_id))?.is_some() {
            return Ok(canonical);
        }
        Ok(format!(
            "{}-{}",
            canonical,
            collision_suffix(definition_path)
        ))
    }

    /// Create a worktree for `name` on `branch`, branching from `start_point`
    /// if the branch does not exist yet.
    ///
    /// Idempotent: if a worktree of the same name already points at a valid
    /// path, it is returned as-is.
    pub fn create(
        &self,
        name: &str,
        branch: &str,
        start_point: &str,
        custom_path: Option<&Path>,
    ) -> Result<WorktreeInfo> {
        if let Some(existing) = self.get(name)? {
            if existing.path.exists() {
                return Ok(existing);
            }
            // Registered but missing on disk: prune and recreate
            self.prune()?;
        }

        let path = custom_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.path_for(name));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let path_str = path.to_string_lossy().to_string();
        let output = if git_ops::branch_exists(&self.repo_root, branch)? {
            Command::new("git")
                .args(["worktree", "add", &path_str, branch])
                .current_dir(&self.repo_root)
                .output()
                .context("Failed to run git worktree add")?
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b", branch, &path_str, start_point])
                .current_dir(&self.repo_root)
                .output()
                .context("Failed to run git worktree add")?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to create worktree '{}': {}", name, stderr);
        }

        Ok(WorktreeInfo {
            name: name.to_string(),
            branch: branch.to_string(),
            path,
        })
    }

    /// Look up a worktree by name.
    pub fn get(&self, name: &str) -> Result<Option<WorktreeInfo>> {
        Ok(self.list()?.into_iter().find(|w| w.name == name))
    }

    /// All worktrees of the repository except the primary working copy.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to run git worktree list")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git worktree list failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut worktrees = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        for line in stdout.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(p));
                current_branch = None;
            } else if let Some(b) = line.strip_prefix("branch ") {
                current_branch = Some(b.trim_start_matches("refs/heads/").to_string());
            } else if line.is_empty() {
                if let (Some(path), Some(branch)) = (current_path.take(), current_branch.take()) {
                    push_worktree(&mut worktrees, &self.repo_root, path, branch);
                }
            }
        }
        if let (Some(path), Some(branch)) = (current_path, current_branch) {
            push_worktree(&mut worktrees, &self.repo_root, path, branch);
        }

        Ok(worktrees)
    }

    /// Remove a worktree and clean up its directory. Idempotent.
    ///
    /// `force` also removes worktrees with uncommitted changes.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let Some(info) = self.get(name)? else {
            return Ok(());
        };

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        let path_str = info.path.to_string_lossy().to_string();
        args.push(&path_str);

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to run git worktree remove")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to remove worktree '{}': {}", name, stderr.trim());
        }

        // Even after git removes the registration, clean up directory debris
        if info.path.exists() {
            std::fs::remove_dir_all(&info.path)
                .with_context(|| format!("Failed to remove {}", info.path.display()))?;
        }
        Ok(())
    }

    /// Drop stale worktree registrations whose directories are gone.
    pub fn prune(&self) -> Result<()> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to run git worktree prune")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git worktree prune failed: {}", stderr);
        }
        Ok(())
    }
}

fn push_worktree(
    worktrees: &mut Vec<WorktreeInfo>,
    repo_root: &Path,
    path: PathBuf,
    branch: String,
) {
    // Skip the primary working copy; only linked worktrees are managed
    if path == repo_root || path.canonicalize().ok() == repo_root.canonicalize().ok() {
        return;
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    worktrees.push(WorktreeInfo { name, branch, path });
}
