//! Per-spec execution lifecycle.
//!
//! One call to [`run_spec`] drives a spec from pending to completed or
//! failed: acquire its lock, resolve the start point, ensure the worktree,
//! invoke the agent, verify commits (autocommitting if configured), and
//! optionally merge the result into the layer's staging branch. Every state
//! transition is persisted before the next step runs.

use anyhow::Result;
use colored::Colorize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{Agent, AgentRequest};
use crate::autocommit::{verify_and_commit, CommitOutcome};
use crate::cancel::CancelToken;
use crate::config::{Config, ConflictMode, TemplateVars};
use crate::dag::{
    effective_deps, CommitStatus, Document, LayerStaging, MergeState, MergeStatus,
    ResolutionMethod, SpecRuntime, SpecStatus,
};
use crate::lock::LockManager;
use crate::merge_errors;
use crate::output::SpecOutput;
use crate::progress::ProgressTracker;
use crate::staging::{stage_branch, MergeResolution, StagingEngine};
use crate::worktree::{worktree_name, Worktrees};

/// Everything a worker needs to drive one spec. All collaborators are
/// explicit; nothing module-global.
pub struct RunContext {
    pub doc: Arc<Mutex<Document>>,
    pub config: Config,
    pub dag_id: String,
    pub project: String,
    pub run_id: String,
    pub definition_path: PathBuf,
    pub agent: Arc<dyn Agent>,
    pub worktrees: Worktrees,
    pub staging: Arc<StagingEngine>,
    pub locks: LockManager,
    pub heartbeat_registry: Arc<Mutex<BTreeSet<String>>>,
    pub progress: Arc<ProgressTracker>,
    pub cancel: Arc<CancelToken>,
    /// Allow reuse of a previously-failed spec's worktree.
    pub force: bool,
}

impl RunContext {
    /// Mutate the shared document and persist it atomically.
    pub fn with_doc<T>(&self, f: impl FnOnce(&mut Document) -> T) -> Result<T> {
        let mut doc = self.doc.lock().expect("document mutex poisoned");
        let value = f(&mut doc);
        doc.save()?;
        Ok(value)
    }

    fn update_spec(&self, spec_id: &str, f: impl FnOnce(&mut SpecRuntime)) -> Result<()> {
        self.with_doc(|doc| f(doc.spec_runtime_mut(spec_id)))
    }
}

/// Registers a spec with the heartbeat tick for as long as it runs.
struct HeartbeatRegistration {
    registry: Arc<Mutex<BTreeSet<String>>>,
    spec_id: String,
}

impl HeartbeatRegistration {
    fn new(registry: Arc<Mutex<BTreeSet<String>>>, spec_id: &str) -> Self {
        registry
            .lock()
            .expect("heartbeat registry poisoned")
            .insert(spec_id.to_string());
        Self {
            registry,
            spec_id: spec_id.to_string(),
        }
    }
}

impl Drop for HeartbeatRegistration {
    fn drop(&mut self) {
        self.registry
            .lock()
            .expect("heartbeat registry poisoned")
            .remove(&self.spec_id);
    }
}

/// Drive one spec to completion or failure.
///
/// Spec-level failures (agent non-zero, commit verification exhausted, a
/// worktree that needs --force) are recorded in state and returned as
/// `Ok(SpecStatus::Failed)`. An `Err` aborts the whole run: a staging merge
/// conflict, or a scheduler invariant violation.
pub fn run_spec(ctx: &RunContext, spec_id: &str) -> Result<SpecStatus> {
    // Snapshot the definition data and prior runtime under one lock
    let (layer_idx, layer_id, description, timeout, prior) = {
        let doc = ctx.doc.lock().expect("document mutex poisoned");
        let (layer_idx, layer, feature) = doc
            .dag
            .find_feature(spec_id)
            .ok_or_else(|| anyhow::anyhow!("unknown spec '{}'", spec_id))?;

        // Scheduler invariant: every dependency has completed
        let deps = effective_deps(&doc, spec_id, ctx.config.staging_enabled());
        for dep in &deps {
            let done = doc
                .specs
                .get(dep)
                .map(|r| r.status == SpecStatus::Completed)
                .unwrap_or(false);
            if !done {
                anyhow::bail!(
                    "scheduler invariant violated: spec '{}' dispatched before dependency '{}' completed",
                    spec_id,
                    dep
                );
            }
        }

        (
            layer_idx,
            layer.id.clone(),
            feature.description.clone(),
            feature.timeout.map(Duration::from_secs),
            doc.specs.get(spec_id).cloned().unwrap_or_default(),
        )
    };

    // Re-running a failed spec with a surviving worktree needs an explicit
    // opt-in, except when the failure was the engine's own stale-lock
    // reclassification.
    if prior.status == SpecStatus::Failed && !ctx.force {
        let stale_reclass = prior
            .failure_reason
            .as_deref()
            .map(|r| r.starts_with("stale lock detected"))
            .unwrap_or(false);
        let worktree_alive = prior
            .worktree_path
            .as_deref()
            .map(|p| Path::new(p).exists())
            .unwrap_or(false);
        if worktree_alive && !stale_reclass {
            let reason = merge_errors::failed_worktree_requires_force(
                spec_id,
                prior.worktree_path.as_deref().unwrap_or_default(),
            );
            ctx.update_spec(spec_id, |rt| {
                rt.failure_reason = Some(reason.clone());
            })?;
            ctx.progress.mark_running();
            ctx.progress.mark_failed();
            eprintln!("{} [{}] {}", "✗".red(), spec_id, reason);
            return Ok(SpecStatus::Failed);
        }
    }

    // Acquire the spec lock and register it with the heartbeat tick
    let _lock = ctx.locks.acquire_spec(spec_id, &ctx.run_id)?;
    let _registration = HeartbeatRegistration::new(Arc::clone(&ctx.heartbeat_registry), spec_id);

    ctx.update_spec(spec_id, |rt| {
        rt.status = SpecStatus::Running;
        rt.started_at = Some(crate::utc_now_iso());
        rt.completed_at = None;
        rt.failure_reason = None;
        rt.exit_code = None;
        rt.current_stage = Some("preparing".to_string());
        rt.blocked_by.clear();
    })?;
    ctx.progress.mark_running();

    match execute(ctx, spec_id, layer_idx, &layer_id, &description, timeout, &prior) {
        Ok(ExecOutcome::Completed) => {
            ctx.progress.mark_completed();
            Ok(SpecStatus::Completed)
        }
        Ok(ExecOutcome::Failed(reason)) => {
            fail_spec(ctx, spec_id, &reason)?;
            Ok(SpecStatus::Failed)
        }
        Err(err) => {
            // Fatal for the run; the spec's own state was already persisted
            Err(err)
        }
    }
}

enum ExecOutcome {
    Completed,
    Failed(String),
}

#[allow(clippy::too_many_arguments)]
fn execute(
    ctx: &RunContext,
    spec_id: &str,
    layer_idx: usize,
    layer_id: &str,
    description: &str,
    timeout: Option<Duration>,
    prior: &SpecRuntime,
) -> Result<ExecOutcome> {
    // Start point: base branch for L0 (or when staging is off), previous
    // layer's staging branch otherwise
    let base_branch = base_branch_for_layer(ctx, layer_idx)?;

    // Branch: reuse the persisted name on resume, resolve fresh otherwise
    let branch = match &prior.branch {
        Some(b) => b.clone(),
        None => ctx
            .worktrees
            .resolve_branch(&ctx.dag_id, spec_id, &ctx.definition_path)?,
    };

    // Worktree: reuse a recorded path that still exists, create otherwise
    let name = worktree_name(&ctx.dag_id, spec_id);
    let worktree_path = match prior.worktree_path.as_deref() {
        Some(p) if Path::new(p).exists() => PathBuf::from(p),
        _ => {
            match ctx.worktrees.create(&name, &branch, &base_branch, None) {
                Ok(info) => info.path,
                Err(e) => return Ok(ExecOutcome::Failed(format!("worktree: {:#}", e))),
            }
        }
    };

    ctx.update_spec(spec_id, |rt| {
        rt.branch = Some(branch.clone());
        rt.worktree_path = Some(worktree_path.display().to_string());
        rt.current_stage = Some("executing".to_string());
    })?;

    let mut output = SpecOutput::open(&ctx.config, &ctx.project, &ctx.dag_id, spec_id);
    output.line(&format!("Starting agent (branch {})", branch));

    let prompt = format!("Implement spec '{}': {}", spec_id, description);
    let request = AgentRequest {
        spec_id,
        prompt: &prompt,
        work_dir: &worktree_path,
        branch: Some(&branch),
        timeout,
    };
    let exit_code = match ctx
        .agent
        .execute(&request, &ctx.cancel, &mut |line| output.line(line))
    {
        Ok(code) => code,
        Err(e) => {
            if ctx.cancel.is_cancelled() {
                let reason = if ctx.cancel.is_signalled() {
                    "interrupted by signal"
                } else {
                    "cancelled by fail-fast"
                };
                return Ok(ExecOutcome::Failed(reason.to_string()));
            }
            return Ok(ExecOutcome::Failed(format!("agent: {:#}", e)));
        }
    };

    ctx.update_spec(spec_id, |rt| {
        rt.exit_code = Some(exit_code);
        rt.current_stage = Some("verifying".to_string());
    })?;

    // Commit verification runs whether or not the agent exited 0
    let vars = TemplateVars {
        spec_id: spec_id.to_string(),
        worktree: worktree_path.display().to_string(),
        branch: branch.clone(),
        base_branch: base_branch.clone(),
        dag_id: ctx.dag_id.clone(),
    };
    let commit = match verify_and_commit(
        &ctx.config,
        ctx.agent.as_ref(),
        &ctx.cancel,
        &vars,
        timeout,
        &mut |line| output.line(line),
    ) {
        Ok(outcome) => outcome,
        Err(e) => CommitOutcome::Failed {
            reason: format!("commit verification: {:#}", e),
        },
    };

    let commit_failure = match &commit {
        CommitOutcome::Committed { sha } => {
            ctx.update_spec(spec_id, |rt| {
                rt.commit_status = Some(CommitStatus::Committed);
                rt.commit_sha = Some(sha.clone());
            })?;
            None
        }
        CommitOutcome::Pending => {
            ctx.update_spec(spec_id, |rt| {
                rt.commit_status = Some(CommitStatus::Pending);
            })?;
            None
        }
        CommitOutcome::Failed { reason } => {
            ctx.update_spec(spec_id, |rt| {
                rt.commit_status = Some(CommitStatus::Failed);
            })?;
            Some(reason.clone())
        }
    };

    if exit_code != 0 {
        return Ok(ExecOutcome::Failed(format!(
            "agent exited with code {}",
            exit_code
        )));
    }
    if let Some(reason) = commit_failure {
        return Ok(ExecOutcome::Failed(reason));
    }

    ctx.update_spec(spec_id, |rt| {
        rt.status = SpecStatus::Completed;
        rt.completed_at = Some(crate::utc_now_iso());
        rt.current_stage = None;
    })?;
    output.line("Spec completed");

    // Post-completion merge hook
    if ctx.config.automerge
        && matches!(commit, CommitOutcome::Committed { .. })
        && !prior.merged_to_staging
    {
        automerge(ctx, spec_id, layer_id, description, &branch, &base_branch, timeout)?;
        output.line("Merged into layer staging branch");
    }

    Ok(ExecOutcome::Completed)
}

/// Start point for a layer's spec branches.
///
/// With staging enabled, later layers branch from the previous layer's
/// staging branch; the whole stage chain up to that layer is ensured
/// (idempotently) so resume never sees a half-built chain.
fn base_branch_for_layer(ctx: &RunContext, layer_idx: usize) -> Result<String> {
    if !ctx.config.staging_enabled() || layer_idx == 0 {
        return Ok(ctx.config.base_branch.clone());
    }
    ensure_stage_chain(ctx, layer_idx - 1)
}

/// Ensure staging branches exist for layers `0..=upto`, returning the branch
/// of layer `upto`.
fn ensure_stage_chain(ctx: &RunContext, upto: usize) -> Result<String> {
    let layer_ids: Vec<String> = {
        let doc = ctx.doc.lock().expect("document mutex poisoned");
        doc.dag.layers.iter().map(|l| l.id.clone()).collect()
    };

    let mut source = ctx.config.base_branch.clone();
    let mut last = source.clone();
    for layer_id in layer_ids.iter().take(upto + 1) {
        let branch = stage_branch(&ctx.dag_id, layer_id);
        let created = ctx.staging.create_or_reuse_stage(&branch, &source)?;
        if created {
            record_stage(ctx, layer_id, &branch)?;
        }
        source = branch.clone();
        last = branch;
    }
    Ok(last)
}

fn record_stage(ctx: &RunContext, layer_id: &str, branch: &str) -> Result<()> {
    ctx.with_doc(|doc| {
        doc.staging
            .entry(layer_id.to_string())
            .or_insert_with(|| LayerStaging {
                branch: branch.to_string(),
                created_at: Some(crate::utc_now_iso()),
                specs_merged: vec![],
            });
    })
}

/// Conflict resolver backed by a dedicated agent session run in the primary
/// working copy, used when `AUTOSPEC_DAG_ON_CONFLICT=agent`.
struct AgentConflictResolver<'a> {
    agent: &'a dyn Agent,
    cancel: &'a CancelToken,
    timeout: Option<Duration>,
}

impl crate::staging::ConflictResolver for AgentConflictResolver<'_> {
    fn resolve(
        &self,
        repo_root: &Path,
        conflict: &crate::staging::MergeConflict,
    ) -> Result<()> {
        let prompt = format!(
            "A merge of branch '{}' into '{}' has conflicts in: {}. Resolve every \
             conflict in this repository, `git add` the resolved files, and conclude \
             the merge with `git commit`. Do not abort the merge.",
            conflict.spec_branch,
            conflict.stage_branch,
            conflict.conflicts.join(", ")
        );
        let request = AgentRequest {
            spec_id: &conflict.spec_id,
            prompt: &prompt,
            work_dir: repo_root,
            branch: None,
            timeout: self.timeout,
        };
        let code = self
            .agent
            .execute(&request, self.cancel, &mut |line| {
                println!("{} {}", format!("[{}:merge]", conflict.spec_id).cyan(), line);
            })?;
        if code != 0 {
            anyhow::bail!("resolution agent exited with code {}", code);
        }
        Ok(())
    }
}

/// Merge a freshly-completed spec into its layer's staging branch.
///
/// On conflict: with `on_conflict=agent`, a resolution agent session gets a
/// chance to conclude the merge; otherwise (or if it fails) the conflict is
/// fatal for the run — merge state is persisted, the rich conflict block is
/// printed, and the error propagates so the scheduler aborts non-zero.
fn automerge(
    ctx: &RunContext,
    spec_id: &str,
    layer_id: &str,
    description: &str,
    branch: &str,
    base_branch: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    let stage = stage_branch(&ctx.dag_id, layer_id);
    let created = ctx.staging.create_or_reuse_stage(&stage, base_branch)?;
    if created {
        record_stage(ctx, layer_id, &stage)?;
    }

    let resolver = AgentConflictResolver {
        agent: ctx.agent.as_ref(),
        cancel: &ctx.cancel,
        timeout,
    };
    let resolver: Option<&dyn crate::staging::ConflictResolver> =
        match ctx.config.on_conflict {
            ConflictMode::Agent => Some(&resolver),
            ConflictMode::Manual => None,
        };

    match ctx
        .staging
        .merge_spec_resolving(&stage, branch, spec_id, description, resolver)
    {
        Ok(resolution) => ctx.with_doc(|doc| {
            let staging = doc
                .staging
                .entry(layer_id.to_string())
                .or_insert_with(|| LayerStaging {
                    branch: stage.clone(),
                    created_at: Some(crate::utc_now_iso()),
                    specs_merged: vec![],
                });
            if !staging.specs_merged.iter().any(|s| s == spec_id) {
                staging.specs_merged.push(spec_id.to_string());
            }
            let rt = doc.spec_runtime_mut(spec_id);
            rt.merged_to_staging = true;
            rt.merge = Some(MergeState {
                status: MergeStatus::Merged,
                merged_at: Some(crate::utc_now_iso()),
                resolution_method: match resolution {
                    MergeResolution::Clean => ResolutionMethod::None,
                    MergeResolution::ResolvedByAgent => ResolutionMethod::Agent,
                },
                ..Default::default()
            });
        }),
        Err(err) => {
            if let Some(conflict) = err.downcast_ref::<crate::staging::MergeConflict>() {
                let conflicts = conflict.conflicts.clone();
                ctx.update_spec(spec_id, |rt| {
                    rt.merge = Some(MergeState {
                        status: MergeStatus::MergeFailed,
                        conflicts,
                        ..Default::default()
                    });
                })?;
                eprintln!("\n{}", err);
            }
            Err(err)
        }
    }
}

fn fail_spec(ctx: &RunContext, spec_id: &str, reason: &str) -> Result<()> {
    ctx.update_spec(spec_id, |rt| {
        rt.status = SpecStatus::Failed;
        rt.completed_at = Some(crate::utc_now_iso());
        rt.failure_reason = Some(reason.to_string());
        rt.current_stage = None;
    })?;
    ctx.progress.mark_failed();
    eprintln!("{} [{}] {}", "✗".red(), spec_id, reason);
    Ok(())
}
