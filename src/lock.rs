//! Run and spec lock files.
//!
//! Locks prevent two engine processes from racing on the same specs and let
//! a later run detect that an earlier one crashed. A run lock covers the
//! whole spec set of a run; a spec lock exists only while its spec is
//! running and carries a heartbeat refreshed by a background tick. A lock is
//! stale when its owning pid is dead or (for spec locks) its heartbeat is
//! older than [`STALE_THRESHOLD_SECS`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dag::atomic_write;

/// Heartbeats older than this mark a spec lock stale.
pub const STALE_THRESHOLD_SECS: i64 = 120;
/// Interval at which the heartbeat tick rewrites spec locks.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Whether the pid recorded in a lock still maps to a live process.
///
/// On Linux the kernel's process table is consulted directly via `/proc`;
/// other unixes fall back to a signal-0 probe. Platforms where neither works
/// report the owner as dead, which errs toward reclaiming the lock rather
/// than wedging every future run behind it.
pub fn lock_owner_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/proc").join(pid.to_string()).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// One lock per run, covering every spec the run may execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLock {
    pub run_id: String,
    pub pid: u32,
    pub specs: BTreeSet<String>,
    pub started_at: String,
}

/// One lock per running spec, heartbeat refreshed while the worker lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecLock {
    pub spec_id: String,
    pub run_id: String,
    pub pid: u32,
    pub started_at: String,
    pub heartbeat: String,
}

impl SpecLock {
    /// Seconds since the recorded heartbeat; `None` when unparseable.
    pub fn heartbeat_age_secs(&self) -> Option<i64> {
        let parsed = chrono::DateTime::parse_from_rfc3339(&self.heartbeat).ok()?;
        Some((chrono::Utc::now() - parsed.with_timezone(&chrono::Utc)).num_seconds())
    }

    /// Stale when the owning process is dead or the heartbeat is too old.
    pub fn is_stale(&self) -> bool {
        if !lock_owner_alive(self.pid) {
            return true;
        }
        match self.heartbeat_age_secs() {
            Some(age) => age > STALE_THRESHOLD_SECS,
            None => true,
        }
    }
}

/// Overlap with a live run, surfaced as a user-facing hard error.
#[derive(Debug)]
pub struct LockContention {
    pub run_id: String,
    pub pid: u32,
    pub overlapping: Vec<String>,
}

impl fmt::Display for LockContention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Specs are locked by run '{}' (PID {}); overlapping specs: {}",
            self.run_id,
            self.pid,
            self.overlapping.join(", ")
        )
    }
}

impl std::error::Error for LockContention {}

/// Probe result for a spec lock during resume.
#[derive(Debug)]
pub enum SpecLockProbe {
    Missing,
    Fresh(SpecLock),
    Stale(SpecLock),
}

/// Lock file operations rooted at one state directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    state_dir: PathBuf,
}

impl LockManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn run_lock_path(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(format!("run-{}.lock", run_id))
    }

    pub fn spec_lock_path(&self, spec_id: &str) -> PathBuf {
        self.state_dir.join(format!("spec-{}.lock", spec_id))
    }

    /// Acquire the run lock over `specs`.
    ///
    /// Scans existing run locks first: stale ones (dead pid) are removed,
    /// and any surviving lock whose spec set intersects `specs` fails the
    /// acquisition with a [`LockContention`] naming the holder.
    pub fn acquire_run(&self, run_id: &str, specs: &BTreeSet<String>) -> Result<RunLockGuard> {
        fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create state dir {}", self.state_dir.display())
        })?;

        for existing in self.list_run_locks()? {
            let (path, lock) = existing;
            if !lock_owner_alive(lock.pid) {
                // Stale: recovered silently, removal failure never blocks
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!("Warning: failed to remove stale lock {}: {}", path.display(), e);
                }
                continue;
            }
            let overlapping: Vec<String> =
                lock.specs.intersection(specs).cloned().collect();
            if !overlapping.is_empty() {
                return Err(LockContention {
                    run_id: lock.run_id,
                    pid: lock.pid,
                    overlapping,
                }
                .into());
            }
        }

        let lock = RunLock {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            specs: specs.clone(),
            started_at: crate::utc_now_iso(),
        };
        let path = self.run_lock_path(run_id);
        write_lock(&path, &lock)?;
        Ok(RunLockGuard { path })
    }

    /// Write a spec lock before the spec transitions to running. A stale
    /// leftover lock for the same spec is replaced.
    pub fn acquire_spec(&self, spec_id: &str, run_id: &str) -> Result<SpecLockGuard> {
        fs::create_dir_all(&self.state_dir)?;

        let path = self.spec_lock_path(spec_id);
        if let Ok(Some(existing)) = self.read_spec_lock(spec_id) {
            if !existing.is_stale() && existing.pid != std::process::id() {
                anyhow::bail!(
                    "spec '{}' is locked by run '{}' (PID {})",
                    spec_id,
                    existing.run_id,
                    existing.pid
                );
            }
        }

        let now = crate::utc_now_iso();
        let lock = SpecLock {
            spec_id: spec_id.to_string(),
            run_id: run_id.to_string(),
            pid: std::process::id(),
            started_at: now.clone(),
            heartbeat: now,
        };
        write_lock(&path, &lock)?;
        Ok(SpecLockGuard {
            path,
            spec_id: spec_id.to_string(),
        })
    }

    /// Inspect the lock of a spec recorded as running, for stale detection.
    pub fn probe_spec(&self, spec_id: &str) -> SpecLockProbe {
        match self.read_spec_lock(spec_id) {
            Ok(Some(lock)) if lock.is_stale() => SpecLockProbe::Stale(lock),
            Ok(Some(lock)) => SpecLockProbe::Fresh(lock),
            _ => SpecLockProbe::Missing,
        }
    }

    /// Remove a spec lock; failures are logged, never fatal.
    pub fn release_spec(&self, spec_id: &str) {
        let path = self.spec_lock_path(spec_id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                eprintln!("Warning: failed to remove lock {}: {}", path.display(), e);
            }
        }
    }

    /// Rewrite the heartbeat of every listed spec lock owned by this process.
    pub fn heartbeat(&self, spec_ids: &BTreeSet<String>) {
        let own_pid = std::process::id();
        for spec_id in spec_ids {
            if let Ok(Some(mut lock)) = self.read_spec_lock(spec_id) {
                if lock.pid != own_pid {
                    continue;
                }
                lock.heartbeat = crate::utc_now_iso();
                if let Err(e) = write_lock(&self.spec_lock_path(spec_id), &lock) {
                    eprintln!("Warning: heartbeat write failed for {}: {}", spec_id, e);
                }
            }
        }
    }

    pub fn read_spec_lock(&self, spec_id: &str) -> Result<Option<SpecLock>> {
        read_lock(&self.spec_lock_path(spec_id))
    }

    pub fn read_run_lock(&self, run_id: &str) -> Result<Option<RunLock>> {
        read_lock(&self.run_lock_path(run_id))
    }

    fn list_run_locks(&self) -> Result<Vec<(PathBuf, RunLock)>> {
        let mut locks = Vec::new();
        if !self.state_dir.exists() {
            return Ok(locks);
        }
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with("run-") && name.ends_with(".lock") {
                match read_lock::<RunLock>(&path) {
                    Ok(Some(lock)) => locks.push((path, lock)),
                    // Unreadable lock files are treated as stale debris
                    _ => {
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        Ok(locks)
    }
}

fn write_lock<T: Serialize>(path: &Path, lock: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(lock).context("Failed to serialize lock")?;
    atomic_write(path, json.as_bytes())
}

fn read_lock<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read lock {}", path.display()))?;
    let lock = serde_json::from_str(&raw)
        .with_context(|| format!("Corrupt lock file {}", path.display()))?;
    Ok(Some(lock))
}

/// RAII guard for the run lock; the file is removed on drop.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if self.path.exists() {
                eprintln!(
                    "Warning: failed to remove run lock {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// RAII guard for one spec lock; the file is removed on drop.
#[derive(Debug)]
pub struct SpecLockGuard {
    path: PathBuf,
    spec_id: String,
}

impl SpecLockGuard {
    pub fn spec_id(&self) -> &str {
        &self.spec_id
    }
}

impl Drop for SpecLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if self.path.exists() {
                eprintln!(
                    "Warning: failed to remove spec lock {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Background tick that refreshes heartbeats for the currently running specs.
///
/// The registry is shared with the scheduler: workers add their spec id when
/// they start and remove it when they settle.
pub struct HeartbeatTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HeartbeatTicker {
    pub fn start(manager: LockManager, registry: Arc<Mutex<BTreeSet<String>>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut elapsed = 0u64;
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(250));
                elapsed += 250;
                if elapsed >= HEARTBEAT_INTERVAL_SECS * 1000 {
                    elapsed = 0;
                    let specs = registry.lock().expect("heartbeat registry poisoned").clone();
                    manager.heartbeat(&specs);
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn specs(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lock_owner_alive_for_own_process() {
        assert!(lock_owner_alive(std::process::id()));
    }

    #[test]
    fn test_lock_owner_dead_for_unused_pid() {
        // Near the default pid_max ceiling; no process will hold it
        assert!(!lock_owner_alive(4_194_000));
    }

    #[test]
    fn test_acquire_and_release_run_lock() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let guard = manager.acquire_run("r1", &specs(&["a", "b"])).unwrap();
        assert!(manager.run_lock_path("r1").exists());
        drop(guard);
        assert!(!manager.run_lock_path("r1").exists());
    }

    #[test]
    fn test_overlapping_run_lock_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let _guard = manager.acquire_run("R1", &specs(&["a", "b"])).unwrap();
        let err = manager
            .acquire_run("R2", &specs(&["b", "c"]))
            .unwrap_err();

        let contention = err.downcast_ref::<LockContention>().expect("LockContention");
        assert_eq!(contention.run_id, "R1");
        assert_eq!(contention.overlapping, vec!["b".to_string()]);

        let msg = err.to_string();
        assert!(msg.contains("b"), "got: {}", msg);
        assert!(msg.contains("R1"), "got: {}", msg);
        assert!(msg.contains("PID"), "got: {}", msg);
    }

    #[test]
    fn test_disjoint_run_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let _g1 = manager.acquire_run("R1", &specs(&["a"])).unwrap();
        let g2 = manager.acquire_run("R2", &specs(&["b"]));
        assert!(g2.is_ok());
    }

    #[test]
    fn test_stale_run_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        // Lock written by a dead process
        let dead = RunLock {
            run_id: "dead-run".to_string(),
            pid: 4_194_000,
            specs: specs(&["a"]),
            started_at: crate::utc_now_iso(),
        };
        write_lock(&manager.run_lock_path("dead-run"), &dead).unwrap();

        let guard = manager.acquire_run("R1", &specs(&["a"]));
        assert!(guard.is_ok());
        assert!(!manager.run_lock_path("dead-run").exists());
    }

    #[test]
    fn test_spec_lock_probe_fresh_and_stale() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        assert!(matches!(manager.probe_spec("a"), SpecLockProbe::Missing));

        let guard = manager.acquire_spec("a", "R1").unwrap();
        assert!(matches!(manager.probe_spec("a"), SpecLockProbe::Fresh(_)));
        drop(guard);
        assert!(matches!(manager.probe_spec("a"), SpecLockProbe::Missing));

        // Dead-pid lock is stale regardless of heartbeat
        let stale = SpecLock {
            spec_id: "a".to_string(),
            run_id: "R0".to_string(),
            pid: 4_194_000,
            started_at: crate::utc_now_iso(),
            heartbeat: crate::utc_now_iso(),
        };
        write_lock(&manager.spec_lock_path("a"), &stale).unwrap();
        assert!(matches!(manager.probe_spec("a"), SpecLockProbe::Stale(_)));
    }

    #[test]
    fn test_old_heartbeat_is_stale() {
        let lock = SpecLock {
            spec_id: "a".to_string(),
            run_id: "R1".to_string(),
            pid: std::process::id(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            heartbeat: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(lock.is_stale());
    }

    #[test]
    fn test_heartbeat_refresh() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let _guard = manager.acquire_spec("a", "R1").unwrap();
        let before = manager.read_spec_lock("a").unwrap().unwrap().heartbeat;

        std::thread::sleep(Duration::from_millis(1100));
        manager.heartbeat(&specs(&["a"]));
        let after = manager.read_spec_lock("a").unwrap().unwrap().heartbeat;
        assert_ne!(before, after);
    }

    #[test]
    fn test_stale_spec_lock_replaced_on_acquire() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let stale = SpecLock {
            spec_id: "a".to_string(),
            run_id: "old".to_string(),
            pid: 4_194_000,
            started_at: crate::utc_now_iso(),
            heartbeat: crate::utc_now_iso(),
        };
        write_lock(&manager.spec_lock_path("a"), &stale).unwrap();

        let guard = manager.acquire_spec("a", "new").unwrap();
        let lock = manager.read_spec_lock("a").unwrap().unwrap();
        assert_eq!(lock.run_id, "new");
        assert_eq!(lock.pid, std::process::id());
        drop(guard);
    }
}
