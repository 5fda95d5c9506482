use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::TaskState;

/// Process-wide counters, shared with the (out-of-scope) exposition layer.
#[derive(Debug, Default)]
pub struct Metrics {
    pub valid_status_updates: AtomicU64,
    pub invalid_status_updates: AtomicU64,
    pub valid_framework_messages: AtomicU64,
    pub invalid_framework_messages: AtomicU64,
    pub recovery_errors: AtomicU64,
    tasks: [AtomicU64; TaskState::COUNT],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task_state(&self, state: TaskState) {
        self.tasks[state.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_state_count(&self, state: TaskState) -> u64 {
        self.tasks[state.index()].load(Ordering::Relaxed)
    }
}
