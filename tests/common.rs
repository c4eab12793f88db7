//! Shared fixtures for integration tests: a temp git repo with a DAG file
//! inside it, a scratch config, and a scripted in-process agent.
#![allow(dead_code)]

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use autospec_dag::agent::{Agent, AgentRequest};
use autospec_dag::cancel::CancelToken;
use autospec_dag::config::Config;

pub struct TestEnv {
    pub dir: TempDir,
    pub repo: PathBuf,
    pub dag_path: PathBuf,
}

pub fn git(repo: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Create a git repo with one commit on `main` and the given DAG file in it.
pub fn setup_env(dag_yaml: &str) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test User"]);
    std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "Initial commit"]);

    let dag_path = repo.join("test.dag.yaml");
    std::fs::write(&dag_path, dag_yaml).unwrap();

    TestEnv {
        dir,
        repo,
        dag_path,
    }
}

/// Config with all on-disk side effects redirected into the temp dir.
pub fn test_config(env: &TestEnv) -> Config {
    Config {
        state_dir: Some(env.dir.path().join("state")),
        log_dir: Some(env.dir.path().join("logs")),
        worktree_root: Some(env.dir.path().join("worktrees")),
        autocommit: false,
        ..Default::default()
    }
}

/// What the scripted agent does for one spec.
#[derive(Clone)]
pub enum Behavior {
    /// Sleep, then write a file and commit it.
    Commit { delay_ms: u64 },
    /// Sleep, then exit with the given non-zero code.
    Fail { delay_ms: u64, code: i32 },
}

/// Start/end timing of one agent invocation.
pub struct SpecEvent {
    pub spec_id: String,
    pub start: Instant,
    pub end: Instant,
}

/// In-process agent driven by a per-spec behavior table.
///
/// Tracks invocation order, concurrency (current and peak), and start/end
/// intervals, and honors cancellation mid-sleep.
pub struct ScriptedAgent {
    behaviors: BTreeMap<String, Behavior>,
    pub invocations: Mutex<Vec<String>>,
    pub events: Mutex<Vec<SpecEvent>>,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(id, b)| (id.to_string(), b.clone()))
                .collect(),
            invocations: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn invocation_count(&self, spec_id: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == spec_id)
            .count()
    }

    pub fn interval(&self, spec_id: &str) -> (Instant, Instant) {
        let events = self.events.lock().unwrap();
        let event = events
            .iter()
            .find(|e| e.spec_id == spec_id)
            .unwrap_or_else(|| panic!("no event recorded for {}", spec_id));
        (event.start, event.end)
    }

    fn sleep_cancellable(&self, ms: u64, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

impl Agent for ScriptedAgent {
    fn execute(
        &self,
        req: &AgentRequest,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        self.invocations
            .lock()
            .unwrap()
            .push(req.spec_id.to_string());
        let start = Instant::now();
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(req.spec_id)
            .cloned()
            .unwrap_or(Behavior::Commit { delay_ms: 0 });

        let result = match behavior {
            Behavior::Commit { delay_ms } => {
                if !self.sleep_cancellable(delay_ms, cancel) {
                    Err(anyhow::anyhow!("agent for '{}' cancelled", req.spec_id))
                } else {
                    on_line(&format!("implementing {}", req.spec_id));
                    std::fs::write(
                        req.work_dir.join(format!("{}.txt", req.spec_id)),
                        format!("work for {}\n", req.spec_id),
                    )?;
                    git(req.work_dir, &["add", "-A"]);
                    git(
                        req.work_dir,
                        &["commit", "-m", &format!("feat({}): implement", req.spec_id)],
                    );
                    Ok(0)
                }
            }
            Behavior::Fail { delay_ms, code } => {
                if !self.sleep_cancellable(delay_ms, cancel) {
                    Err(anyhow::anyhow!("agent for '{}' cancelled", req.spec_id))
                } else {
                    on_line(&format!("failing {}", req.spec_id));
                    Ok(code)
                }
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(SpecEvent {
            spec_id: req.spec_id.to_string(),
            start,
            end: Instant::now(),
        });
        result
    }
}

/// Agent that writes a fixed file content, for conflict scenarios.
pub struct ConflictingAgent {
    /// spec id -> (path, content) written before committing
    pub writes: BTreeMap<String, (String, String)>,
}

impl Agent for ConflictingAgent {
    fn execute(
        &self,
        req: &AgentRequest,
        _cancel: &CancelToken,
        _on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let (path, content) = self
            .writes
            .get(req.spec_id)
            .unwrap_or_else(|| panic!("no write scripted for {}", req.spec_id));
        std::fs::write(req.work_dir.join(path), content)?;
        git(req.work_dir, &["add", "-A"]);
        git(
            req.work_dir,
            &["commit", "-m", &format!("feat({}): implement", req.spec_id)],
        );
        Ok(0)
    }
}
