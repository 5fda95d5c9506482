use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AgentResult;
use crate::id::{AgentId, ExecutorId, FrameworkId, TaskId, UpdateUuid};
use crate::resources::Resources;

/// The agent's own description, created once at boot.
/// The id is filled on first registration and is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: Option<AgentId>,
    pub hostname: String,
    pub webui_hostname: String,
    pub resources: Resources,
    pub attributes: BTreeMap<String, String>,
    pub checkpoint_enabled: bool,
}

impl AgentInfo {
    /// Compatibility comparison for recovery: everything but the id must
    /// match, since the freshly computed info has no id yet.
    pub fn compatible_with(&self, other: &AgentInfo) -> bool {
        self.hostname == other.hostname
            && self.webui_hostname == other.webui_hostname
            && self.resources == other.resources
            && self.attributes == other.attributes
            && self.checkpoint_enabled == other.checkpoint_enabled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub framework_id: Option<FrameworkId>,
    pub user: String,
    pub name: String,
    pub checkpoint_enabled: bool,
    /// Seconds the coordinator waits for a failed-over scheduler.
    pub failover_timeout: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl CommandInfo {
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            arguments: vec![],
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub framework_id: Option<FrameworkId>,
    pub name: Option<String>,
    pub command: CommandInfo,
    pub resources: Resources,
    pub source: Option<String>,
}

/// A task as handed to the agent by the coordinator.
/// Exactly one of `executor` and `command` is expected to be set; a task
/// carrying only a command is a "command task" whose executor is synthesized
/// by the framework model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resources,
    pub executor: Option<ExecutorInfo>,
    pub command: Option<CommandInfo>,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl TaskInfo {
    pub fn is_command_task(&self) -> bool {
        self.executor.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Killed,
    Failed,
    Lost,
    Error,
    Dropped,
    Gone,
    GoneByOperator,
    Unreachable,
    Unknown,
}

impl TaskState {
    /// Whether no further transitions can occur from this state.
    pub fn is_terminal(&self) -> bool {
        match self {
            TaskState::Staging
            | TaskState::Starting
            | TaskState::Running
            | TaskState::Killing => false,
            TaskState::Finished
            | TaskState::Killed
            | TaskState::Failed
            | TaskState::Lost
            | TaskState::Error
            | TaskState::Dropped
            | TaskState::Gone
            | TaskState::GoneByOperator
            | TaskState::Unreachable
            | TaskState::Unknown => true,
        }
    }

    pub const COUNT: usize = 14;

    pub fn index(&self) -> usize {
        match self {
            TaskState::Staging => 0,
            TaskState::Starting => 1,
            TaskState::Running => 2,
            TaskState::Killing => 3,
            TaskState::Finished => 4,
            TaskState::Killed => 5,
            TaskState::Failed => 6,
            TaskState::Lost => 7,
            TaskState::Error => 8,
            TaskState::Dropped => 9,
            TaskState::Gone => 10,
            TaskState::GoneByOperator => 11,
            TaskState::Unreachable => 12,
            TaskState::Unknown => 13,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Killing => "TASK_KILLING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Lost => "TASK_LOST",
            TaskState::Error => "TASK_ERROR",
            TaskState::Dropped => "TASK_DROPPED",
            TaskState::Gone => "TASK_GONE",
            TaskState::GoneByOperator => "TASK_GONE_BY_OPERATOR",
            TaskState::Unreachable => "TASK_UNREACHABLE",
            TaskState::Unknown => "TASK_UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// Where a status update originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusSource {
    Coordinator,
    Agent,
    Executor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: Option<String>,
    pub source: StatusSource,
    pub reason: Option<String>,
    pub timestamp: f64,
}

/// A tracked task: the agent's view of one launched task and the history of
/// statuses observed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub state: TaskState,
    pub resources: Resources,
    pub statuses: Vec<TaskStatus>,
    /// Whether the task carried its own command rather than an executor.
    pub command_task: bool,
    /// The original description, kept so a task that never reached its
    /// executor can be relaunched after a restart.
    pub info: Option<TaskInfo>,
}

impl Task {
    pub fn from_task_info(
        task: &TaskInfo,
        state: TaskState,
        executor_id: &ExecutorId,
        framework_id: &FrameworkId,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            name: task.name.clone(),
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            state,
            resources: task.resources.clone(),
            statuses: vec![],
            command_task: task.is_command_task(),
            info: Some(task.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    pub agent_id: Option<AgentId>,
    pub executor_id: Option<ExecutorId>,
    pub status: TaskStatus,
    pub uuid: UpdateUuid,
}

impl StatusUpdate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        framework_id: FrameworkId,
        agent_id: Option<AgentId>,
        task_id: TaskId,
        state: TaskState,
        source: StatusSource,
        message: Option<String>,
        reason: Option<String>,
        executor_id: Option<ExecutorId>,
    ) -> Self {
        Self {
            framework_id,
            agent_id,
            executor_id,
            status: TaskStatus {
                task_id,
                state,
                message,
                source,
                reason,
                timestamp: now_secs(),
            },
            uuid: UpdateUuid::random(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.status.task_id
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

impl std::fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (uuid {}) for task {} of framework {}",
            self.status.state,
            self.uuid,
            self.status.task_id,
            self.framework_id
        )
    }
}

/// The agent-to-coordinator message surface.
/// The wire transport behind it is out of scope; implementations resolve the
/// coordinator pid to an endpoint themselves.
#[async_trait::async_trait]
pub trait CoordinatorClient: Send + Sync + 'static {
    async fn register_agent(&self, info: &AgentInfo) -> AgentResult<()>;

    async fn reregister_agent(
        &self,
        agent_id: &AgentId,
        info: &AgentInfo,
        executor_infos: &[ExecutorInfo],
        tasks: &[Task],
    ) -> AgentResult<()>;

    async fn status_update(&self, update: &StatusUpdate) -> AgentResult<()>;

    async fn exited_executor(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        exit_status: i32,
    ) -> AgentResult<()>;

    /// Relay an executor-originated payload to the framework scheduler
    /// at `framework_pid`.
    async fn executor_to_framework(
        &self,
        framework_pid: &str,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        data: &[u8],
    ) -> AgentResult<()>;

    async fn pong(&self) -> AgentResult<()>;
}

/// The agent-to-executor message surface, one client per executor process.
#[async_trait::async_trait]
pub trait ExecutorClient: Send + Sync + 'static {
    async fn executor_registered(
        &self,
        executor_info: &ExecutorInfo,
        framework_id: &FrameworkId,
        framework_info: &FrameworkInfo,
        agent_id: &AgentId,
        agent_info: &AgentInfo,
    ) -> AgentResult<()>;

    async fn executor_reregistered(
        &self,
        agent_id: &AgentId,
        agent_info: &AgentInfo,
    ) -> AgentResult<()>;

    async fn run_task(
        &self,
        framework_info: &FrameworkInfo,
        framework_id: &FrameworkId,
        framework_pid: &str,
        task: &TaskInfo,
    ) -> AgentResult<()>;

    async fn kill_task(&self, framework_id: &FrameworkId, task_id: &TaskId) -> AgentResult<()>;

    async fn status_update_acknowledgement(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        uuid: &UpdateUuid,
    ) -> AgentResult<()>;

    async fn framework_to_executor(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        data: &[u8],
    ) -> AgentResult<()>;

    async fn shutdown_executor(&self) -> AgentResult<()>;

    async fn reconnect_executor(&self, agent_id: &AgentId) -> AgentResult<()>;
}

/// A coordinator endpoint: the libprocess-style pid string paired with a
/// client that can reach it.
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub pid: String,
    pub client: Arc<dyn CoordinatorClient>,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("pid", &self.pid)
            .finish()
    }
}

impl PartialEq for CoordinatorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

/// An executor endpoint, set when the executor (re-)registers.
#[derive(Clone)]
pub struct ExecutorHandle {
    pub pid: String,
    pub client: Arc<dyn ExecutorClient>,
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("pid", &self.pid)
            .finish()
    }
}

impl PartialEq for ExecutorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

/// Resolves a checkpointed executor pid back to a live endpoint during
/// recovery. The transport is out of scope; tests supply a stub.
pub trait ExecutorPidResolver: Send + Sync + 'static {
    fn connect(&self, pid: &str) -> AgentResult<ExecutorHandle>;
}
