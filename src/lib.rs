//! # autospec-dag - Parallel DAG Execution Engine
//!
//! Drives a dependency graph of specs through an external CLI-agent workflow,
//! each spec in an isolated git worktree, and propagates committed results up
//! the layer graph via staging branches.
//!
//! ## Overview
//!
//! A DAG file declares ordered layers of features ("specs"). The engine
//! selects ready specs, runs the agent for each inside its own worktree,
//! verifies that work was committed, and merges completed branches into a
//! per-layer staging branch so the next layer builds on top. Runtime state is
//! persisted inline in the DAG file after every transition, so a long run can
//! be interrupted and resumed without losing progress.
//!
//! ## Core Concepts
//!
//! - **Specs**: units of work with dependencies, executed by an external agent
//! - **Layers**: ordered groups of specs; layer N branches from layer N-1's
//!   staging branch
//! - **Worktrees**: isolated git worktrees, one per running spec
//! - **Locks**: on-disk run and spec locks with heartbeat-based stale detection
//!
//! ## Modules
//!
//! - [`dag`] - DAG definition parsing, validation, and inline runtime state
//! - [`scheduler`] - ready-set computation and bounded parallel dispatch
//! - [`executor`] - per-spec lifecycle (worktree, agent, commit verification)
//! - [`staging`] - per-layer staging branches and merge propagation
//! - [`lock`] - run/spec lock files with stale detection
//! - [`worktree`] - isolated git worktree operations
//! - [`resume`] - crash recovery and re-driving of incomplete specs
//! - [`cleanup`] - post-run worktree classification and removal
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use autospec_dag::config::Config;
//! use autospec_dag::dag::Document;
//!
//! let config = Config::load().expect("Failed to load config");
//! let doc = Document::load(Path::new("features.dag.yaml"))
//!     .expect("Failed to load DAG");
//! println!("{} layers, {} specs", doc.dag.layers.len(), doc.spec_count());
//! # let _ = config;
//! ```

// Re-export all public modules
pub mod agent;
pub mod autocommit;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod dag;
pub mod executor;
pub mod git_ops;
pub mod lock;
pub mod merge_errors;
pub mod output;
pub mod progress;
pub mod resume;
pub mod scheduler;
pub mod staging;
pub mod worktree;

/// Default path constants for the autospec directory structure.
pub mod paths {
    /// Directory containing run state, locks, and migrated sidecar files:
    /// `.autospec/state/dag-runs`
    pub const STATE_DIR: &str = ".autospec/state/dag-runs";
    /// Legacy in-project log directory: `.autospec/logs`
    pub const LEGACY_LOGS_DIR: &str = ".autospec/logs";
    /// Directory containing per-spec worktrees: `.autospec/worktrees`
    pub const WORKTREES_DIR: &str = ".autospec/worktrees";
}

/// Current time as an RFC3339 UTC timestamp, e.g. `2026-08-01T12:00:00Z`.
///
/// Every timestamp the engine persists (run state, spec transitions, lock
/// heartbeats, merge records) goes through this one function, so state files
/// stay comparable across hosts and timezones and lock staleness math never
/// mixes offsets.
pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
