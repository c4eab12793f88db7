//! Thread-safe progress counters with change callbacks.

use std::sync::Mutex;

/// Snapshot of run progress handed to the callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

type Callback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Mutex-guarded counters updated by workers as specs change state.
///
/// The callback receives a copy of the counters and is invoked
/// while the internal mutex is held: it must be non-blocking and must not
/// call back into the tracker.
pub struct ProgressTracker {
    inner: Mutex<ProgressSnapshot>,
    callback: Option<Callback>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            inner: Mutex::new(ProgressSnapshot {
                total,
                pending: total,
                ..Default::default()
            }),
            callback: None,
        }
    }

    pub fn with_callback(total: usize, callback: impl Fn(ProgressSnapshot) + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(ProgressSnapshot {
                total,
                pending: total,
                ..Default::default()
            }),
            callback: Some(Box::new(callback)),
        }
    }

    /// Seed counters from prior state (resume): specs already completed or
    /// failed are moved out of pending.
    pub fn seed(&self, completed: usize, failed: usize, blocked: usize) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        inner.completed = completed;
        inner.failed = failed;
        inner.blocked = blocked;
        inner.pending = inner
            .total
            .saturating_sub(completed + failed + blocked);
        let snapshot = *inner;
        self.fire(snapshot);
    }

    pub fn mark_running(&self) {
        self.update(|p| {
            p.pending = p.pending.saturating_sub(1);
            p.running += 1;
        });
    }

    pub fn mark_completed(&self) {
        self.update(|p| {
            p.running = p.running.saturating_sub(1);
            p.completed += 1;
        });
    }

    pub fn mark_failed(&self) {
        self.update(|p| {
            p.running = p.running.saturating_sub(1);
            p.failed += 1;
        });
    }

    /// A pending spec became unreachable because a dependency failed.
    pub fn mark_blocked(&self) {
        self.update(|p| {
            p.pending = p.pending.saturating_sub(1);
            p.blocked += 1;
        });
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.inner.lock().expect("progress mutex poisoned")
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot().is_complete()
    }

    fn update(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        f(&mut inner);
        let snapshot = *inner;
        self.fire(snapshot);
    }

    fn fire(&self, snapshot: ProgressSnapshot) {
        if let Some(cb) = &self.callback {
            cb(snapshot);
        }
    }
}
