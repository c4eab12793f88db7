//! Crash recovery: validate prior state and re-drive incomplete specs.
//!
//! Resume loads the inline state (migrating a legacy sidecar first), detects
//! specs left `running` by a dead process via their locks, reclassifies them
//! as failed, and hands the remaining work back to the scheduler. Completed
//! specs are skipped and their worktrees reused read-only.

use anyhow::Result;
use colored::Colorize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::agent::Agent;
use crate::config::Config;
use crate::dag::{self, Document, MigrationOutcome, RunStatus, SpecStatus};
use crate::git_ops;
use crate::lock::{LockManager, SpecLockProbe};
use crate::output;
use crate::scheduler::{self, RunOptions};

/// Invalid prior state: missing run, corrupt fields, or already completed.
#[derive(Debug)]
pub struct ResumeValidation(pub String);

impl fmt::Display for ResumeValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cannot resume: {}", self.0)
    }
}

impl std::error::Error for ResumeValidation {}

/// Resume a previously-interrupted run.
pub fn resume(
    dag_path: &Path,
    config: Config,
    agent: Arc<dyn Agent>,
    opts: RunOptions,
) -> Result<RunStatus> {
    let mut doc = Document::load(dag_path)?;
    dag::validate(&doc)?;

    let definition_dir = dag_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let repo_root = git_ops::repo_root(&definition_dir)?;
    let state_dir = config.state_dir(&repo_root);

    match dag::migrate_legacy_state(&mut doc, &state_dir)? {
        MigrationOutcome::Migrated => {
            println!(
                "{} Migrated legacy sidecar state into {}",
                "→".cyan(),
                dag_path.display()
            );
        }
        MigrationOutcome::InlineWins => {
            eprintln!(
                "{} Both inline state and a legacy sidecar exist; using inline state (sidecar left untouched)",
                "⚠".yellow()
            );
        }
        MigrationOutcome::NoSidecar => {}
    }

    validate_state(&doc)?;

    let locks = LockManager::new(&state_dir);
    reclassify_stale(&mut doc, &locks)?;

    // Legacy in-project logs move to the user cache dir on first resume
    let project = repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();
    match output::migrate_legacy_logs(&repo_root, &config, &project, &doc.dag_id()) {
        Ok(0) => {}
        Ok(n) => println!("{} Migrated {} legacy log file(s)", "→".cyan(), n),
        Err(e) => eprintln!("{} Log migration failed: {}", "⚠".yellow(), e),
    }

    scheduler::start(doc, config, agent, opts)
}

fn validate_state(doc: &Document) -> Result<()> {
    let Some(run) = &doc.run else {
        return Err(ResumeValidation(format!(
            "{} has no run state; use `run` to start it",
            doc.path.display()
        ))
        .into());
    };
    if run.run_id.is_empty() {
        return Err(ResumeValidation("run state has an empty run_id".to_string()).into());
    }
    if run.dag_file.is_empty() {
        return Err(ResumeValidation("run state has an empty dag_file".to_string()).into());
    }
    if run.status == RunStatus::Completed {
        return Err(ResumeValidation(format!(
            "run '{}' already completed; use `run --fresh` to start over",
            run.run_id
        ))
        .into());
    }
    Ok(())
}

/// Reclassify specs recorded as `running` whose lock is missing or stale.
///
/// The reclassification is persisted before scheduling so a second crash
/// during resume never loses it.
pub fn reclassify_stale(doc: &mut Document, locks: &LockManager) -> Result<usize> {
    let running: Vec<String> = doc
        .specs
        .iter()
        .filter(|(_, rt)| rt.status == SpecStatus::Running)
        .map(|(id, _)| id.clone())
        .collect();

    let mut reclassified = 0;
    for spec_id in running {
        let last_heartbeat = match locks.probe_spec(&spec_id) {
            SpecLockProbe::Fresh(_) => continue,
            SpecLockProbe::Stale(lock) => lock.heartbeat,
            SpecLockProbe::Missing => "none".to_string(),
        };
        let rt = doc.spec_runtime_mut(&spec_id);
        rt.status = SpecStatus::Failed;
        rt.failure_reason = Some(format!(
            "stale lock detected (last heartbeat: {})",
            last_heartbeat
        ));
        locks.release_spec(&spec_id);
        eprintln!(
            "{} [{}] Stale lock detected; spec will be re-run",
            "⚠".yellow(),
            spec_id
        );
        reclassified += 1;
    }

    if reclassified > 0 {
        doc.save()?;
    }
    Ok(reclassified)
}
