//! Ready-set computation and bounded parallel dispatch.
//!
//! A single supervisor loop feeds a pool of worker threads, one per running
//! spec, bounded by `max_parallel`. Readiness is recomputed after every
//! settle; between a dependency's completion (persisted) and the dependent's
//! dispatch there is a happens-before edge through the document mutex.

use anyhow::Result;
use colored::Colorize;
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::Agent;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::dag::{effective_deps, new_run_state, status_counts, Document, RunStatus, SpecStatus};
use crate::executor::{run_spec, RunContext};
use crate::git_ops;
use crate::lock::{HeartbeatTicker, LockManager};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::staging::StagingEngine;
use crate::worktree::Worktrees;

/// Options for one engine run.
pub struct RunOptions {
    /// Reuse worktrees of previously-failed specs.
    pub force: bool,
    /// Shared cancellation token; the caller installs the signal handler.
    pub cancel: Arc<CancelToken>,
    /// Optional progress callback (must be non-blocking).
    pub on_progress: Option<Box<dyn Fn(ProgressSnapshot) + Send + Sync>>,
}

impl RunOptions {
    pub fn new(cancel: Arc<CancelToken>) -> Self {
        Self {
            force: false,
            cancel,
            on_progress: None,
        }
    }
}

struct WorkerResult {
    spec_id: String,
    fatal: Option<anyhow::Error>,
}

/// Execute every incomplete spec of a validated document.
///
/// Returns the final [`RunStatus`]; fatal conditions (staging merge
/// conflict, scheduler invariant violation) persist a failed run and return
/// the underlying error instead.
pub fn start(
    doc: Document,
    config: Config,
    agent: Arc<dyn Agent>,
    opts: RunOptions,
) -> Result<RunStatus> {
    let definition_path = doc.path.clone();
    let definition_dir = definition_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let repo_root = git_ops::repo_root(&definition_dir)?;
    let project = repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();
    let dag_id = doc.dag_id();

    let staging = Arc::new(StagingEngine::new(&repo_root));
    // A half-finished merge in the primary working copy poisons every
    // staging operation; refuse before any spec is dispatched.
    staging.assert_no_merge_in_progress()?;

    // Targets: everything not already completed
    let targets: BTreeSet<String> = doc
        .dag
        .features()
        .filter(|f| {
            doc.specs
                .get(&f.id)
                .map(|r| r.status != SpecStatus::Completed)
                .unwrap_or(true)
        })
        .map(|f| f.id.clone())
        .collect();

    let locks = LockManager::new(config.state_dir(&repo_root));

    let mut doc = doc;
    let run_id = match &doc.run {
        Some(run) if !run.run_id.is_empty() => run.run_id.clone(),
        _ => {
            doc.run = Some(new_run_state(&doc));
            doc.run.as_ref().expect("just set").run_id.clone()
        }
    };
    let _run_lock = locks.acquire_run(&run_id, &targets)?;

    if let Some(run) = doc.run.as_mut() {
        run.status = RunStatus::Running;
        run.completed_at = None;
        if run.started_at.is_none() {
            run.started_at = Some(crate::utc_now_iso());
        }
    }
    doc.save()?;

    let counts = status_counts(&doc);
    let progress = match opts.on_progress {
        Some(cb) => Arc::new(ProgressTracker::with_callback(counts.total, cb)),
        None => Arc::new(ProgressTracker::new(counts.total)),
    };
    progress.seed(counts.completed, 0, 0);

    let heartbeat_registry = Arc::new(Mutex::new(BTreeSet::new()));
    let _ticker = HeartbeatTicker::start(locks.clone(), Arc::clone(&heartbeat_registry));

    let worktree_root = config.worktree_root(&repo_root);
    let ctx = Arc::new(RunContext {
        doc: Arc::new(Mutex::new(doc)),
        config,
        dag_id,
        project,
        run_id,
        definition_path,
        agent,
        worktrees: Worktrees::new(&repo_root, worktree_root),
        staging,
        locks,
        heartbeat_registry,
        progress,
        cancel: opts.cancel,
        force: opts.force,
    });

    let fatal = supervise(&ctx, &targets);
    finish(&ctx, fatal)
}

/// The supervisor loop: dispatch ready specs, wait for settles, propagate
/// fail-fast, mark newly-unreachable specs blocked.
fn supervise(ctx: &Arc<RunContext>, targets: &BTreeSet<String>) -> Option<anyhow::Error> {
    let max_parallel = ctx.config.max_parallel.max(1);
    let (tx, rx) = mpsc::channel::<WorkerResult>();
    let mut in_flight: BTreeSet<String> = BTreeSet::new();
    let mut done: BTreeSet<String> = BTreeSet::new();
    let mut handles = Vec::new();
    let mut fatal: Option<anyhow::Error> = None;

    loop {
        let can_dispatch = fatal.is_none() && !ctx.cancel.is_cancelled();
        if can_dispatch {
            for spec_id in compute_ready(ctx, targets, &done, &in_flight) {
                if in_flight.len() >= max_parallel {
                    break;
                }
                in_flight.insert(spec_id.clone());
                let ctx = Arc::clone(ctx);
                let tx = tx.clone();
                handles.push(std::thread::spawn(move || {
                    let fatal = match run_spec(&ctx, &spec_id) {
                        Ok(_) => None,
                        Err(e) => Some(e),
                    };
                    let _ = tx.send(WorkerResult { spec_id, fatal });
                }));
            }
        }

        if in_flight.is_empty() {
            if !can_dispatch {
                break;
            }
            mark_blocked(ctx, targets, &mut done, &in_flight);
            if compute_ready(ctx, targets, &done, &in_flight).is_empty() {
                break;
            }
            continue;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(result) => {
                in_flight.remove(&result.spec_id);
                done.insert(result.spec_id.clone());

                if let Some(err) = result.fatal {
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                    ctx.cancel
                        .cancel(crate::cancel::CancelReason::FailFast);
                    continue;
                }

                let failed = spec_failed(ctx, &result.spec_id);
                if failed && ctx.config.fail_fast {
                    eprintln!(
                        "{} Fail-fast: cancelling remaining specs after '{}' failed",
                        "✗".red(),
                        result.spec_id
                    );
                    ctx.cancel
                        .cancel(crate::cancel::CancelReason::FailFast);
                }
                if failed {
                    mark_blocked(ctx, targets, &mut done, &in_flight);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    for handle in handles {
        let _ = handle.join();
    }
    fatal
}

/// Specs ready to dispatch, in DAG authoring order (stable, deterministic).
fn compute_ready(
    ctx: &RunContext,
    targets: &BTreeSet<String>,
    done: &BTreeSet<String>,
    in_flight: &BTreeSet<String>,
) -> Vec<String> {
    let doc = ctx.doc.lock().expect("document mutex poisoned");
    let staging_enabled = ctx.config.staging_enabled();

    let mut ready = Vec::new();
    for feature in doc.dag.features() {
        let id = &feature.id;
        if !targets.contains(id) || done.contains(id) || in_flight.contains(id) {
            continue;
        }
        let deps = effective_deps(&doc, id, staging_enabled);
        let all_done = deps.iter().all(|dep| {
            doc.specs
                .get(dep)
                .map(|r| r.status == SpecStatus::Completed)
                .unwrap_or(false)
        });
        if all_done {
            ready.push(id.clone());
        }
    }
    ready
}

fn spec_failed(ctx: &RunContext, spec_id: &str) -> bool {
    let doc = ctx.doc.lock().expect("document mutex poisoned");
    doc.specs
        .get(spec_id)
        .map(|r| r.status == SpecStatus::Failed)
        .unwrap_or(false)
}

/// Mark every undispatched target whose transitive dependencies include a
/// spec that failed in this run as blocked, recording the failed roots.
fn mark_blocked(
    ctx: &RunContext,
    targets: &BTreeSet<String>,
    done: &mut BTreeSet<String>,
    in_flight: &BTreeSet<String>,
) {
    let staging_enabled = ctx.config.staging_enabled();

    let failed_this_run: BTreeSet<String> = {
        let doc = ctx.doc.lock().expect("document mutex poisoned");
        done.iter()
            .filter(|id| {
                doc.specs
                    .get(*id)
                    .map(|r| r.status == SpecStatus::Failed)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    };
    if failed_this_run.is_empty() {
        return;
    }

    let mut newly_blocked: Vec<(String, Vec<String>)> = Vec::new();
    {
        let doc = ctx.doc.lock().expect("document mutex poisoned");
        for feature in doc.dag.features() {
            let id = &feature.id;
            if !targets.contains(id) || done.contains(id) || in_flight.contains(id) {
                continue;
            }
            let roots = failed_roots(&doc, id, &failed_this_run, staging_enabled);
            if !roots.is_empty() {
                newly_blocked.push((id.clone(), roots));
            }
        }
    }

    for (id, roots) in newly_blocked {
        let result = ctx.with_doc(|doc| {
            let rt = doc.spec_runtime_mut(&id);
            rt.status = SpecStatus::Blocked;
            rt.blocked_by = roots.clone();
        });
        if let Err(e) = result {
            eprintln!("Warning: failed to persist blocked state for {}: {}", id, e);
        }
        ctx.progress.mark_blocked();
        eprintln!(
            "{} [{}] Blocked by failed specs: {}",
            "⚠".yellow(),
            id,
            roots.join(", ")
        );
        done.insert(id);
    }
}

/// Failed specs reachable through a spec's transitive dependency closure.
fn failed_roots(
    doc: &Document,
    spec_id: &str,
    failed: &BTreeSet<String>,
    staging_enabled: bool,
) -> Vec<String> {
    let mut roots = BTreeSet::new();
    let mut stack = vec![spec_id.to_string()];
    let mut seen = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for dep in effective_deps(doc, &id, staging_enabled) {
            if failed.contains(&dep) {
                roots.insert(dep.clone());
            }
            stack.push(dep);
        }
    }
    roots.into_iter().collect()
}

/// Persist the final run status and map it (plus any fatal error) to the
/// caller.
fn finish(ctx: &RunContext, fatal: Option<anyhow::Error>) -> Result<RunStatus> {
    let counts = {
        let doc = ctx.doc.lock().expect("document mutex poisoned");
        status_counts(&doc)
    };

    let status = if ctx.cancel.is_signalled() {
        RunStatus::Interrupted
    } else if fatal.is_some() || counts.failed > 0 || counts.blocked > 0 || counts.pending > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    ctx.with_doc(|doc| {
        if let Some(run) = doc.run.as_mut() {
            run.status = status;
            run.completed_at = Some(crate::utc_now_iso());
        }
    })?;

    if let Some(err) = fatal {
        return Err(err);
    }
    Ok(status)
}
