use std::path::PathBuf;

use crate::checkpoint::AgentState;
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid, TaskId, UpdateUuid};
use crate::message::{
    CoordinatorHandle, ExecutorHandle, FrameworkInfo, StatusUpdate, TaskInfo,
};
use crate::update::AppendKind;

/// Everything the agent actor processes: coordinator and executor messages,
/// isolation callbacks, timers, and completions of background I/O.
/// State must be re-validated by every handler; the framework, executor, or
/// task a message targets may be gone by the time the message is processed.
pub enum AgentEvent {
    // Coordinator messages.
    NewCoordinatorDetected {
        coordinator: CoordinatorHandle,
    },
    NoCoordinatorDetected,
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentReregistered {
        agent_id: AgentId,
    },
    RunTask {
        framework_info: FrameworkInfo,
        framework_id: FrameworkId,
        coordinator_pid: String,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
        /// The sender pid; `None` for in-process callers.
        from: Option<String>,
    },
    FrameworkToExecutor {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    UpdateFramework {
        framework_id: FrameworkId,
        pid: String,
    },
    StatusUpdateAcknowledgement {
        agent_id: AgentId,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    },
    Shutdown {
        /// The sender pid; `None` for in-process callers.
        from: Option<String>,
    },
    Ping,

    // Executor messages.
    RegisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        sender: ExecutorHandle,
    },
    ReregisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<TaskInfo>,
        updates: Vec<StatusUpdate>,
        sender: ExecutorHandle,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    ExecutorToFramework {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },

    // Isolation callbacks.
    ExecutorStarted {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        forked_pid: u32,
    },
    ExecutorTerminated {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        exit_status: i32,
        destroyed: bool,
        message: String,
    },

    // Timers. Run-uuid-tagged timers are ignored when the uuid is stale.
    RetryRegistration,
    RegisterExecutorTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_uuid: RunUuid,
    },
    ShutdownExecutorTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_uuid: RunUuid,
    },
    ReregisterExecutorTimeout,
    CheckDiskUsage,
    StatusUpdateRetry {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    },

    // Completions of background work.
    RecoveredState {
        result: Result<Option<AgentState>, String>,
    },
    RebuildRecoveredState {
        state: AgentState,
    },
    RecoveryComplete,
    UpdateAppendComplete {
        framework_id: FrameworkId,
        task_id: TaskId,
        kind: AppendKind,
        result: Result<(), String>,
    },
    CheckpointWritten {
        description: String,
        result: Result<(), String>,
    },
    GcComplete {
        path: PathBuf,
    },
    DiskUsageSampled {
        result: Result<f64, String>,
    },
}
