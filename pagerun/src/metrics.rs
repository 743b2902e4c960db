//! Engine-wide execution counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::execution::ExecutionState;

/// Lock-free counters shared by the engine and its execution tasks.
///
/// Counters are monotonic; deltas are the caller's concern.
#[derive(Debug, Default)]
pub struct EngineMetricsStorage {
    pub(crate) executions_started: AtomicU64,
    pub(crate) executions_completed: AtomicU64,
    pub(crate) executions_failed: AtomicU64,
    pub(crate) executions_cancelled: AtomicU64,
    pub(crate) conflicts_rejected: AtomicU64,
}

impl EngineMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.conflicts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self, state: ExecutionState) {
        let counter = match state {
            ExecutionState::Completed => &self.executions_completed,
            ExecutionState::Failed => &self.executions_failed,
            ExecutionState::Cancelled => &self.executions_cancelled,
            ExecutionState::Idle | ExecutionState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of [`EngineMetricsStorage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_cancelled: u64,
    pub conflicts_rejected: u64,
}

impl EngineMetrics {
    pub fn from_storage(storage: &EngineMetricsStorage) -> Self {
        Self {
            executions_started: storage.executions_started.load(Ordering::Relaxed),
            executions_completed: storage.executions_completed.load(Ordering::Relaxed),
            executions_failed: storage.executions_failed.load(Ordering::Relaxed),
            executions_cancelled: storage.executions_cancelled.load(Ordering::Relaxed),
            conflicts_rejected: storage.conflicts_rejected.load(Ordering::Relaxed),
        }
    }

    /// Executions started but not yet finished.
    pub fn executions_in_flight(&self) -> u64 {
        self.executions_started.saturating_sub(
            self.executions_completed + self.executions_failed + self.executions_cancelled,
        )
    }
}
