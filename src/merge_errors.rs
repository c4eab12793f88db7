//! Actionable error messages for merge and resume failures.
//!
//! Provides structured error blocks with context, diagnosis, and concrete
//! next steps so users can recover without digging through git state.

/// Format a staging merge conflict with recovery steps.
///
/// Printed when merging a spec branch into its layer's staging branch hits
/// content conflicts; the working copy is left unresolved on purpose.
pub fn merge_conflict(
    spec_id: &str,
    description: &str,
    spec_branch: &str,
    stage_branch: &str,
    conflicts: &[String],
) -> String {
    let file_list = if conflicts.is_empty() {
        "  (no conflicted paths reported)".to_string()
    } else {
        conflicts
            .iter()
            .map(|f| format!("  - {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "MERGE CONFLICT: spec {} could not be merged\n\n\
         Context:\n\
         \x20 - Spec: {} ({})\n\
         \x20 - Branch: {}\n\
         \x20 - Target: {}\n\n\
         Conflicted files:\n\
         {}\n\n\
         The working copy has been left mid-merge so you can resolve it.\n\n\
         Next Steps:\n\
         \x20 1. Inspect the conflicts:  git status\n\
         \x20 2. Resolve each file, then:  git add <file> && git commit\n\
         \x20 3. Or abort the merge:  git merge --abort\n\
         \x20 4. Resume the run:  autospec-dag resume <dag-file>",
        spec_id, spec_id, description, spec_branch, stage_branch, file_list
    )
}

/// Format the refusal printed when resume finds an in-progress merge.
pub fn interrupted_merge(repo_root: &str) -> String {
    format!(
        "Error: An unfinished merge is in progress in {}\n\n\
         Context:\n\
         \x20 - MERGE_HEAD is present; a previous staging merge was interrupted\n\
         \x20 - Resuming now would stack a second merge on top of it\n\n\
         Next Steps:\n\
         \x20 1. Inspect the merge state:  git status\n\
         \x20 2. Finish it:  resolve conflicts, then git add <files> && git commit\n\
         \x20 3. Or abort it:  git merge --abort\n\
         \x20 4. Then resume:  autospec-dag resume <dag-file>",
        repo_root
    )
}

/// Format the batch-merge refusal for a spec with no commits ahead of target.
pub fn no_commits(spec_id: &str, branch: &str, target: &str) -> String {
    format!(
        "Error: Spec {} has no commits to merge\n\n\
         Context:\n\
         \x20 - Branch: {}\n\
         \x20 - Target: {}\n\
         \x20 - The branch has no commits ahead of the target\n\n\
         Next Steps:\n\
         \x20 1. If the spec's work was lost, re-run it\n\
         \x20 2. Or skip empty specs:  autospec-dag merge --skip-no-commits",
        spec_id, branch, target
    )
}

/// Format the batch-merge refusal for a spec with uncommitted work.
pub fn uncommitted_changes(spec_id: &str, worktree: &str) -> String {
    format!(
        "Error: Spec {} has uncommitted changes in its worktree\n\n\
         Context:\n\
         \x20 - Worktree: {}\n\
         \x20 - Merging now would silently drop the uncommitted work\n\n\
         Next Steps:\n\
         \x20 1. Commit the work:  git -C {} add -A && git -C {} commit\n\
         \x20 2. Or discard it and merge anyway:  autospec-dag merge --force",
        spec_id, worktree, worktree, worktree
    )
}

/// Message for re-running a failed spec whose worktree still exists.
pub fn failed_worktree_requires_force(spec_id: &str, worktree: &str) -> String {
    format!(
        "Spec {} previously failed and its worktree still exists at {}. \
         Re-run with --force to reuse it, or remove it with: autospec-dag cleanup",
        spec_id, worktree
    )
}
