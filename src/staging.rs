//! Per-layer staging branches and merge propagation.
//!
//! Completed spec branches are merged (no fast-forward) into their layer's
//! staging branch; the next layer branches from that. The primary working
//! copy is a single shared mutable resource: every operation that checks out
//! or merges in it is serialized through one mutex.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::Config;
use crate::dag::{Document, MergeState, MergeStatus, ResolutionMethod, SpecStatus};
use crate::git_ops;
use crate::merge_errors;

/// Staging branch name for a layer: `dag/<dag_id>/stage-<layer_id>`.
pub fn stage_branch(dag_id: &str, layer_id: &str) -> String {
    format!("dag/{}/stage-{}", dag_id, layer_id)
}

/// Staging merge conflict, carried inside `anyhow::Error` so the CLI can
/// downcast it for exit-code mapping.
#[derive(Debug)]
pub struct MergeConflict {
    pub spec_id: String,
    pub description: String,
    pub spec_branch: String,
    pub stage_branch: String,
    pub conflicts: Vec<String>,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            merge_errors::merge_conflict(
                &self.spec_id,
                &self.description,
                &self.spec_branch,
                &self.stage_branch,
                &self.conflicts,
            )
        )
    }
}

impl std::error::Error for MergeConflict {}

/// An unfinished merge found in the primary working copy at resume.
#[derive(Debug)]
pub struct InterruptedMerge {
    pub repo_root: String,
}

impl fmt::Display for InterruptedMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", merge_errors::interrupted_merge(&self.repo_root))
    }
}

impl std::error::Error for InterruptedMerge {}

/// How a merge concluded when a resolver is in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResolution {
    /// Merged without conflicts.
    Clean,
    /// Conflicted, then concluded by the resolver session.
    ResolvedByAgent,
}

/// Hands an unresolved merge to an external resolution session.
///
/// Called with the merge gate held: the working copy is mid-merge and no
/// other staging operation can run until `resolve` returns.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, repo_root: &Path, conflict: &MergeConflict) -> Result<()>;
}

/// Serialized access to branch creation and merging in the primary working
/// copy.
pub struct StagingEngine {
    repo_root: PathBuf,
    gate: Mutex<()>,
}

impl StagingEngine {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            gate: Mutex::new(()),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Create the staging branch at `source_branch`, or reuse it if it
    /// already exists. Idempotent, as required for resume.
    ///
    /// Returns `true` when the branch was created by this call.
    pub fn create_or_reuse_stage(&self, branch: &str, source_branch: &str) -> Result<bool> {
        let _guard = self.gate.lock().expect("staging gate poisoned");
        if git_ops::branch_exists(&self.repo_root, branch)? {
            return Ok(false);
        }
        git_ops::create_branch_from(&self.repo_root, branch, source_branch)?;
        Ok(true)
    }

    /// Merge `spec_branch` into `target_branch` with --no-ff.
    ///
    /// On conflict the working copy is left in the unresolved state and a
    /// [`MergeConflict`] is returned carrying the conflicted paths.
    pub fn merge_spec(
        &self,
        target_branch: &str,
        spec_branch: &str,
        spec_id: &str,
        description: &str,
    ) -> Result<()> {
        self.merge_spec_resolving(target_branch, spec_branch, spec_id, description, None)
            .map(|_| ())
    }

    /// Like [`merge_spec`](Self::merge_spec), but on conflict hands the
    /// unresolved working copy to `resolver` (an agent session) while the
    /// merge gate is still held.
    ///
    /// If the resolver concludes the merge (MERGE_HEAD gone, no conflicted
    /// paths left), the merge counts as resolved; otherwise the working copy
    /// stays mid-merge and the [`MergeConflict`] propagates.
    pub fn merge_spec_resolving(
        &self,
        target_branch: &str,
        spec_branch: &str,
        spec_id: &str,
        description: &str,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<MergeResolution> {
        let _guard = self.gate.lock().expect("staging gate poisoned");
        git_ops::checkout_branch(&self.repo_root, target_branch)?;
        let message = format!("Merge spec {} into {}", spec_id, target_branch);
        let outcome = git_ops::merge_no_ff(&self.repo_root, spec_branch, &message)?;
        if outcome.success {
            return Ok(MergeResolution::Clean);
        }

        let conflict = MergeConflict {
            spec_id: spec_id.to_string(),
            description: description.to_string(),
            spec_branch: spec_branch.to_string(),
            stage_branch: target_branch.to_string(),
            conflicts: outcome.conflicts,
        };

        if let Some(resolver) = resolver {
            match resolver.resolve(&self.repo_root, &conflict) {
                Ok(()) => {
                    let concluded = !git_ops::merge_in_progress(&self.repo_root)?
                        && git_ops::conflicting_paths(&self.repo_root)?.is_empty();
                    if concluded {
                        return Ok(MergeResolution::ResolvedByAgent);
                    }
                }
                Err(e) => {
                    eprintln!("Warning: conflict resolver failed for {}: {}", spec_id, e);
                }
            }
        }

        Err(conflict.into())
    }

    /// Refuse to proceed while the primary working copy has an unfinished
    /// merge (MERGE_HEAD present).
    pub fn assert_no_merge_in_progress(&self) -> Result<()> {
        if git_ops::merge_in_progress(&self.repo_root)? {
            return Err(InterruptedMerge {
                repo_root: self.repo_root.display().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Stable topological order over completed specs for the batch merge phase.
///
/// Dependency edges are the explicit `depends_on` edges between completed
/// specs; ties are broken alphabetically by spec id, so independent specs
/// merge in alphabetical order.
pub fn merge_order(doc: &Document) -> Vec<String> {
    let completed: BTreeSet<String> = doc
        .dag
        .features()
        .filter(|f| {
            doc.specs
                .get(&f.id)
                .map(|r| r.status == SpecStatus::Completed)
                .unwrap_or(false)
        })
        .map(|f| f.id.clone())
        .collect();

    // in-degree over edges restricted to completed specs
    let mut remaining_deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for feature in doc.dag.features() {
        if !completed.contains(&feature.id) {
            continue;
        }
        let deps: BTreeSet<String> = feature
            .depends_on
            .iter()
            .filter(|d| completed.contains(*d))
            .cloned()
            .collect();
        remaining_deps.insert(feature.id.clone(), deps);
    }

    let mut order = Vec::with_capacity(remaining_deps.len());
    while !remaining_deps.is_empty() {
        // BTreeMap iteration gives the alphabetically-first ready spec
        let next = remaining_deps
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone());
        let Some(id) = next else {
            // Cycle among completed specs; validation prevents this, but
            // never loop forever on corrupt state
            break;
        };
        remaining_deps.remove(&id);
        for deps in remaining_deps.values_mut() {
            deps.remove(&id);
        }
        order.push(id);
    }
    order
}

/// Options for the batch merge phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchMergeOptions {
    /// Print the plan without merging.
    pub dry_run: bool,
    /// Skip specs with no commits ahead of the target instead of failing.
    pub skip_no_commits: bool,
    /// Merge even when a spec's worktree still has uncommitted changes.
    pub force: bool,
}

/// Outcome of a batch merge.
#[derive(Debug, Default)]
pub struct BatchMergeReport {
    pub planned: Vec<String>,
    pub merged: Vec<String>,
    pub skipped_no_commits: Vec<String>,
}

/// Merge every completed spec branch into the configured base branch, in
/// topological order.
///
/// Gating (unless overridden): a spec with uncommitted worktree changes or
/// with no commits ahead of the target blocks the whole phase. Conflicts
/// record `merge_failed` on the spec and abort with a [`MergeConflict`].
pub fn batch_merge(
    doc: &mut Document,
    engine: &StagingEngine,
    config: &Config,
    opts: BatchMergeOptions,
) -> Result<BatchMergeReport> {
    engine.assert_no_merge_in_progress()?;

    let order = merge_order(doc);
    let mut report = BatchMergeReport {
        planned: order.clone(),
        ..Default::default()
    };
    if opts.dry_run {
        return Ok(report);
    }

    for spec_id in order {
        let runtime = doc.specs.get(&spec_id).cloned().unwrap_or_default();
        if runtime.merge.as_ref().map(|m| m.status) == Some(MergeStatus::Merged) {
            continue;
        }

        let branch = runtime
            .branch
            .clone()
            .ok_or_else(|| anyhow::anyhow!("spec '{}' is completed but has no branch", spec_id))?;

        if let Some(worktree) = runtime.worktree_path.as_deref() {
            let worktree_path = Path::new(worktree);
            if !opts.force
                && worktree_path.exists()
                && git_ops::has_uncommitted_changes(worktree_path)?
            {
                anyhow::bail!("{}", merge_errors::uncommitted_changes(&spec_id, worktree));
            }
        }

        if git_ops::commits_ahead(engine.repo_root(), &config.base_branch, &branch)? == 0 {
            if opts.skip_no_commits {
                let merge = doc.spec_runtime_mut(&spec_id).merge.get_or_insert_with(MergeState::default);
                merge.status = MergeStatus::Skipped;
                merge.resolution_method = ResolutionMethod::Skipped;
                report.skipped_no_commits.push(spec_id);
                continue;
            }
            anyhow::bail!(
                "{}",
                merge_errors::no_commits(&spec_id, &branch, &config.base_branch)
            );
        }

        let description = doc
            .dag
            .find_feature(&spec_id)
            .map(|(_, _, f)| f.description.clone())
            .unwrap_or_default();

        match engine.merge_spec(&config.base_branch, &branch, &spec_id, &description) {
            Ok(()) => {
                let merge = doc.spec_runtime_mut(&spec_id).merge.get_or_insert_with(MergeState::default);
                merge.status = MergeStatus::Merged;
                merge.merged_at = Some(crate::utc_now_iso());
                report.merged.push(spec_id);
            }
            Err(err) => {
                if let Some(conflict) = err.downcast_ref::<MergeConflict>() {
                    let merge = doc.spec_runtime_mut(&spec_id).merge.get_or_insert_with(MergeState::default);
                    merge.status = MergeStatus::MergeFailed;
                    merge.conflicts = conflict.conflicts.clone();
                    merge.error = Some(format!(
                        "merge of {} into {} conflicted",
                        conflict.spec_branch, conflict.stage_branch
                    ));
                }
                return Err(err);
            }
        }
    }

    Ok(report)
}
