//! Post-execution commit verification and autocommit.
//!
//! After the agent finishes (whatever its exit code), the worktree must hold
//! at least one commit ahead of the spec's base and no uncommitted changes.
//! When autocommit is enabled, a user-supplied command template or a
//! commit-dedicated agent session finalizes stray work, with a bounded retry
//! loop.

use anyhow::{Context, Result};
use regex::Regex;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::agent::{Agent, AgentRequest};
use crate::cancel::CancelToken;
use crate::config::{expand_template, Config, TemplateVars, AUTOCOMMIT_CMD_TIMEOUT_SECS};
use crate::git_ops;

/// Result of commit verification for one spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Clean tree with >= 1 commit ahead of base; sha is the worktree HEAD.
    Committed { sha: String },
    /// Uncommitted changes remain and autocommit is disabled; the spec
    /// continues with `commit_status: pending`.
    Pending,
    /// Verification failed after exhausting autocommit retries.
    Failed { reason: String },
}

fn sha_regex() -> Regex {
    Regex::new(r"^[0-9a-f]{40}$").expect("sha regex is valid")
}

/// Check the worktree: no uncommitted changes and >= 1 commit ahead of base.
fn verify(worktree: &Path, base_branch: &str, branch: &str) -> Result<Option<String>> {
    if git_ops::has_uncommitted_changes(worktree)? {
        return Ok(None);
    }
    if git_ops::commits_ahead(worktree, base_branch, branch)? == 0 {
        return Ok(None);
    }
    let sha = git_ops::head_sha(worktree)?;
    if !sha_regex().is_match(&sha) {
        anyhow::bail!("unexpected HEAD sha '{}'", sha);
    }
    Ok(Some(sha))
}

/// Verify commits for a spec, running the autocommit flow if needed.
pub fn verify_and_commit(
    config: &Config,
    agent: &dyn Agent,
    cancel: &CancelToken,
    vars: &TemplateVars,
    spec_timeout: Option<Duration>,
    on_line: &mut dyn FnMut(&str),
) -> Result<CommitOutcome> {
    let worktree = Path::new(&vars.worktree);

    if let Some(sha) = verify(worktree, &vars.base_branch, &vars.branch)? {
        return Ok(CommitOutcome::Committed { sha });
    }

    let dirty = git_ops::has_uncommitted_changes(worktree)?;
    if !config.autocommit {
        if dirty {
            on_line("Warning: uncommitted changes remain and autocommit is disabled");
            return Ok(CommitOutcome::Pending);
        }
        return Ok(CommitOutcome::Failed {
            reason: format!("no commits ahead of {}", vars.base_branch),
        });
    }

    let retries = config.autocommit_retries.min(10);
    for attempt in 1..=retries {
        on_line(&format!("Autocommit attempt {}/{}", attempt, retries));
        match &config.autocommit_cmd {
            Some(template) => {
                let command = expand_template(template, vars)?;
                run_autocommit_cmd(&command, worktree, on_line)?;
            }
            None => {
                run_commit_agent(agent, cancel, vars, spec_timeout, on_line)?;
            }
        }
        if let Some(sha) = verify(worktree, &vars.base_branch, &vars.branch)? {
            return Ok(CommitOutcome::Committed { sha });
        }
    }

    let reason = if git_ops::has_uncommitted_changes(worktree)? {
        format!("uncommitted changes remain after {} autocommit attempts", retries)
    } else {
        format!("no commits ahead of {}", vars.base_branch)
    };
    Ok(CommitOutcome::Failed { reason })
}

/// Run the user-supplied autocommit command through `sh -c` in the worktree
/// with the hard 30 s timeout.
fn run_autocommit_cmd(
    command: &str,
    worktree: &Path,
    on_line: &mut dyn FnMut(&str),
) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(worktree)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run autocommit command: {}", command))?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let deadline = Instant::now() + Duration::from_secs(AUTOCOMMIT_CMD_TIMEOUT_SECS);
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(line) => on_line(&line),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        if Instant::now() > deadline {
            let _ = child.kill();
            let _ = child.wait();
            for r in readers {
                let _ = r.join();
            }
            anyhow::bail!(
                "autocommit command timed out after {}s",
                AUTOCOMMIT_CMD_TIMEOUT_SECS
            );
        }

        if let Some(status) = child.try_wait()? {
            for r in readers {
                let _ = r.join();
            }
            while let Ok(line) = rx.try_recv() {
                on_line(&line);
            }
            if !status.success() {
                on_line(&format!(
                    "Autocommit command exited with status {}",
                    status.code().unwrap_or(-1)
                ));
            }
            return Ok(());
        }
    }
}

/// Run a commit-dedicated agent session in the worktree.
fn run_commit_agent(
    agent: &dyn Agent,
    cancel: &CancelToken,
    vars: &TemplateVars,
    spec_timeout: Option<Duration>,
    on_line: &mut dyn FnMut(&str),
) -> Result<()> {
    let prompt = format!(
        "Commit all outstanding work for spec '{}'. Stage every change in this \
         worktree and create one or more commits with messages describing the \
         work. Do not modify files beyond what is needed to commit.",
        vars.spec_id
    );
    let request = AgentRequest {
        spec_id: &vars.spec_id,
        prompt: &prompt,
        work_dir: Path::new(&vars.worktree),
        branch: Some(&vars.branch),
        timeout: spec_timeout,
    };
    // Exit code is advisory here; verification decides the outcome
    let _ = agent.execute(&request, cancel, on_line)?;
    Ok(())
}
