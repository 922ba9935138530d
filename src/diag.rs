//! Live task accounting
//!
//! Every background thread the engine spawns (connection read loops, pool
//! idle timers, server handler threads) registers itself here for the length
//! of its life. Tests compare the counts against a baseline to detect leaked
//! threads after a pool is cleared.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kind of background task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Per-connection HTTP/2 client read loop
    ReadLoop,
    /// Pool idle-close timer
    IdleTimer,
    /// Server-side per-stream handler
    ServeHandler,
}

impl TaskKind {
    fn index(self) -> usize {
        match self {
            TaskKind::ReadLoop => 0,
            TaskKind::IdleTimer => 1,
            TaskKind::ServeHandler => 2,
        }
    }
}

static LIVE: [AtomicUsize; 3] = [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)];

/// Number of currently running tasks of `kind`
pub fn live_tasks(kind: TaskKind) -> usize {
    LIVE[kind.index()].load(Ordering::SeqCst)
}

/// Sum of all running background tasks
pub fn total_live_tasks() -> usize {
    LIVE.iter().map(|c| c.load(Ordering::SeqCst)).sum()
}

/// Registers a task for as long as the guard lives
pub(crate) struct TaskGuard {
    kind: TaskKind,
}

impl TaskGuard {
    pub(crate) fn new(kind: TaskKind) -> Self {
        LIVE[kind.index()].fetch_add(1, Ordering::SeqCst);
        TaskGuard { kind }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        LIVE[self.kind.index()].fetch_sub(1, Ordering::SeqCst);
    }
}
