//! Scheduler scenarios: dependency waves, concurrency bounds, fail-fast.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use autospec_dag::cancel::CancelToken;
use autospec_dag::dag::{Document, RunStatus, SpecStatus};
use autospec_dag::scheduler::{self, RunOptions};

use common::{setup_env, test_config, Behavior, ScriptedAgent};

const DIAMOND: &str = r#"schema_version: "1"
dag:
  name: diamond
layers:
  - id: l0
    features:
      - id: a
        description: root
      - id: b
        description: left
        depends_on: [a]
      - id: c
        description: right
        depends_on: [a]
      - id: d
        description: join
        depends_on: [b, c]
"#;

#[test]
fn test_diamond_runs_in_three_waves() {
    let env = setup_env(DIAMOND);
    let config = test_config(&env);

    let agent = Arc::new(ScriptedAgent::new(&[
        ("a", Behavior::Commit { delay_ms: 150 }),
        ("b", Behavior::Commit { delay_ms: 300 }),
        ("c", Behavior::Commit { delay_ms: 300 }),
        ("d", Behavior::Commit { delay_ms: 100 }),
    ]));

    let doc = Document::load(&env.dag_path).unwrap();
    let status = scheduler::start(
        doc,
        config,
        Arc::clone(&agent) as Arc<dyn autospec_dag::agent::Agent>,
        RunOptions::new(CancelToken::new()),
    )
    .unwrap();
    assert_eq!(status, RunStatus::Completed);

    // Wave 1: a finishes before b and c start
    let (_, a_end) = agent.interval("a");
    let (b_start, b_end) = agent.interval("b");
    let (c_start, c_end) = agent.interval("c");
    let (d_start, _) = agent.interval("d");
    assert!(a_end <= b_start, "b started before its dependency finished");
    assert!(a_end <= c_start, "c started before its dependency finished");

    // Independent siblings b and c overlap
    assert!(
        b_start < c_end && c_start < b_end,
        "b and c did not run concurrently"
    );

    // Wave 3: d waits for both
    assert!(b_end <= d_start && c_end <= d_start);

    // Every spec completed with a verified commit
    let doc = Document::load(&env.dag_path).unwrap();
    for id in ["a", "b", "c", "d"] {
        let rt = doc.specs.get(id).unwrap();
        assert_eq!(rt.status, SpecStatus::Completed, "spec {}", id);
        let sha = rt.commit_sha.as_ref().unwrap();
        assert_eq!(sha.len(), 40);
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }
    let run = doc.run.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
}

#[test]
fn test_max_parallel_bounds_concurrency() {
    let yaml = r#"schema_version: "1"
dag:
  name: wide
layers:
  - id: l0
    features:
      - id: s1
        description: w
      - id: s2
        description: w
      - id: s3
        description: w
      - id: s4
        description: w
      - id: s5
        description: w
      - id: s6
        description: w
"#;
    let env = setup_env(yaml);
    let mut config = test_config(&env);
    config.max_parallel = 2;

    let behaviors: Vec<(&str, Behavior)> = ["s1", "s2", "s3", "s4", "s5", "s6"]
        .iter()
        .map(|id| (*id, Behavior::Commit { delay_ms: 100 }))
        .collect();
    let agent = Arc::new(ScriptedAgent::new(&behaviors));

    let doc = Document::load(&env.dag_path).unwrap();
    let status = scheduler::start(
        doc,
        config,
        Arc::clone(&agent) as Arc<dyn autospec_dag::agent::Agent>,
        RunOptions::new(CancelToken::new()),
    )
    .unwrap();

    assert_eq!(status, RunStatus::Completed);
    let peak = agent.peak.load(std::sync::atomic::Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency {} exceeded max_parallel", peak);
    assert_eq!(agent.invocations.lock().unwrap().len(), 6);
}

#[test]
fn test_fail_fast_cancels_running_specs() {
    let yaml = r#"schema_version: "1"
dag:
  name: failfast
layers:
  - id: l0
    features:
      - id: a
        description: fails quickly
      - id: b
        description: long runner
      - id: c
        description: long runner
"#;
    let env = setup_env(yaml);
    let mut config = test_config(&env);
    config.max_parallel = 3;
    config.fail_fast = true;

    let agent = Arc::new(ScriptedAgent::new(&[
        ("a", Behavior::Fail { delay_ms: 50, code: 1 }),
        ("b", Behavior::Commit { delay_ms: 10_000 }),
        ("c", Behavior::Commit { delay_ms: 10_000 }),
    ]));

    let doc = Document::load(&env.dag_path).unwrap();
    let started = Instant::now();
    let status = scheduler::start(
        doc,
        config,
        Arc::clone(&agent) as Arc<dyn autospec_dag::agent::Agent>,
        RunOptions::new(CancelToken::new()),
    )
    .unwrap();

    // Cancellation reached b and c long before their sleeps finished
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "fail-fast did not cancel promptly"
    );
    assert_eq!(status, RunStatus::Failed);

    let doc = Document::load(&env.dag_path).unwrap();
    assert_eq!(doc.specs.get("a").unwrap().status, SpecStatus::Failed);
    for id in ["b", "c"] {
        let st = doc.specs.get(id).map(|r| r.status).unwrap_or_default();
        assert_ne!(st, SpecStatus::Completed, "spec {} must not complete", id);
    }
    assert_eq!(doc.run.unwrap().status, RunStatus::Failed);
}

#[test]
fn test_failed_dependency_blocks_dependents() {
    let yaml = r#"schema_version: "1"
dag:
  name: blocking
layers:
  - id: l0
    features:
      - id: root
        description: fails
      - id: child
        description: needs root
        depends_on: [root]
      - id: grandchild
        description: needs child
        depends_on: [child]
      - id: solo
        description: independent
"#;
    let env = setup_env(yaml);
    let config = test_config(&env);

    let agent = Arc::new(ScriptedAgent::new(&[
        ("root", Behavior::Fail { delay_ms: 10, code: 2 }),
        ("solo", Behavior::Commit { delay_ms: 10 }),
    ]));

    let doc = Document::load(&env.dag_path).unwrap();
    let status = scheduler::start(
        doc,
        config,
        Arc::clone(&agent) as Arc<dyn autospec_dag::agent::Agent>,
        RunOptions::new(CancelToken::new()),
    )
    .unwrap();
    assert_eq!(status, RunStatus::Failed);

    let doc = Document::load(&env.dag_path).unwrap();
    assert_eq!(doc.specs.get("root").unwrap().status, SpecStatus::Failed);
    assert_eq!(doc.specs.get("solo").unwrap().status, SpecStatus::Completed);

    // Both descendants are blocked, naming the failed root
    for id in ["child", "grandchild"] {
        let rt = doc.specs.get(id).unwrap();
        assert_eq!(rt.status, SpecStatus::Blocked, "spec {}", id);
        assert_eq!(rt.blocked_by, vec!["root".to_string()], "spec {}", id);
    }

    // Blocked and failed specs never reached the agent
    assert_eq!(agent.invocation_count("child"), 0);
    assert_eq!(agent.invocation_count("grandchild"), 0);
    let rt = doc.specs.get("root").unwrap();
    assert_eq!(rt.exit_code, Some(2));
    assert!(rt
        .failure_reason
        .as_ref()
        .unwrap()
        .contains("exited with code 2"));
}

#[test]
fn test_authoring_order_is_respected_for_ready_specs() {
    let yaml = r#"schema_version: "1"
dag:
  name: ordered
layers:
  - id: l0
    features:
      - id: zebra
        description: authored first
      - id: apple
        description: authored second
"#;
    let env = setup_env(yaml);
    let mut config = test_config(&env);
    config.max_parallel = 1;

    let agent = Arc::new(ScriptedAgent::new(&[
        ("zebra", Behavior::Commit { delay_ms: 10 }),
        ("apple", Behavior::Commit { delay_ms: 10 }),
    ]));

    let doc = Document::load(&env.dag_path).unwrap();
    scheduler::start(
        doc,
        config,
        Arc::clone(&agent) as Arc<dyn autospec_dag::agent::Agent>,
        RunOptions::new(CancelToken::new()),
    )
    .unwrap();

    // Authoring order, not alphabetical order
    assert_eq!(
        *agent.invocations.lock().unwrap(),
        vec!["zebra".to_string(), "apple".to_string()]
    );
}

#[test]
fn test_run_lock_released_after_run() {
    let env = setup_env(DIAMOND);
    let config = test_config(&env);
    let state_dir = config.state_dir.clone().unwrap();

    let agent = Arc::new(ScriptedAgent::new(&[
        ("a", Behavior::Commit { delay_ms: 0 }),
        ("b", Behavior::Commit { delay_ms: 0 }),
        ("c", Behavior::Commit { delay_ms: 0 }),
        ("d", Behavior::Commit { delay_ms: 0 }),
    ]));

    let doc = Document::load(&env.dag_path).unwrap();
    scheduler::start(
        doc,
        config,
        agent as Arc<dyn autospec_dag::agent::Agent>,
        RunOptions::new(CancelToken::new()),
    )
    .unwrap();

    // No lock files survive a clean run
    let leftovers: Vec<_> = std::fs::read_dir(&state_dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".lock"))
                .collect()
        })
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftover locks: {:?}", leftovers);
}
