use std::time::Duration;

/// Bounded history rings (oldest entries are dropped first).
pub const MAX_COMPLETED_FRAMEWORKS: usize = 50;
pub const MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK: usize = 150;
pub const MAX_COMPLETED_TASKS_PER_EXECUTOR: usize = 200;

/// How long recovered executors get to re-register before they are killed
/// and recovery is declared complete.
pub const EXECUTOR_REREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed delay between (re-)registration attempts with the coordinator.
pub const REGISTRATION_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default agent resources, used when the `resources` flag is empty.
pub const DEFAULT_CPUS: f64 = 1.0;
pub const DEFAULT_MEM: u64 = 1024;
pub const DEFAULT_DISK: u64 = 10240;
pub const DEFAULT_PORTS: (u16, u16) = (31000, 32000);
