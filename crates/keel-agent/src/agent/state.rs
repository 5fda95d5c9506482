use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use log::warn;

use crate::checkpoint::{paths, RecoveredExecutor, RecoveredTask};
use crate::constants::{
    MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK, MAX_COMPLETED_TASKS_PER_EXECUTOR,
};
use crate::error::AgentResult;
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid, TaskId, UpdateUuid};
use crate::message::{
    CommandInfo, ExecutorHandle, ExecutorInfo, FrameworkInfo, Task, TaskInfo, TaskState,
};
use crate::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkState {
    /// Reserved; nothing sets this state today.
    Initializing,
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Registering,
    Running,
    Terminating,
    Terminated,
}

/// Push to a bounded FIFO ring, dropping the oldest entry when full.
pub(crate) fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    ring.push_back(item);
    while ring.len() > capacity {
        ring.pop_front();
    }
}

/// One framework registration and the executors it owns on this agent.
#[derive(Debug)]
pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    /// The framework scheduler's pid, updated by `UpdateFramework`.
    pub pid: String,
    pub state: FrameworkState,
    pub executors: HashMap<ExecutorId, Executor>,
    pub completed_executors: VecDeque<Executor>,
    /// Tasks parked while the framework is initializing (reserved).
    pub pending: Vec<TaskInfo>,
}

impl Framework {
    pub fn new(id: FrameworkId, info: FrameworkInfo, pid: String) -> Self {
        Self {
            id,
            info,
            pid,
            state: FrameworkState::Running,
            executors: HashMap::new(),
            completed_executors: VecDeque::new(),
            pending: vec![],
        }
    }

    /// The executor a task runs on: either the one it names, or for a
    /// command task a synthesized executor whose id equals the task id and
    /// whose command invokes the resolved launcher binary.
    pub fn get_executor_info(&self, launcher_dir: &Path, task: &TaskInfo) -> ExecutorInfo {
        if let Some(executor) = &task.executor {
            let mut executor = executor.clone();
            executor.framework_id = Some(self.id.clone());
            return executor;
        }
        let command_value = task
            .command
            .as_ref()
            .map(|c| c.value.clone())
            .unwrap_or_default();
        let shown = if command_value.chars().count() > 15 {
            let prefix = command_value.chars().take(12).collect::<String>();
            format!("{prefix}...")
        } else {
            command_value.clone()
        };
        let name = format!(
            "Command Executor (Task: {}) (Command: sh -c '{shown}')",
            task.task_id
        );
        // Keep the task command's environment and arguments, but invoke the
        // launcher binary; if the launcher cannot be resolved, run a command
        // that reports the resolution error and fails.
        let mut command = task.command.clone().unwrap_or_else(|| CommandInfo::shell(""));
        match std::fs::canonicalize(launcher_dir.join("keel-executor")) {
            Ok(path) => command.value = path.to_string_lossy().into_owned(),
            Err(e) => {
                command.value = format!("echo '{e}'; exit 1");
            }
        }
        ExecutorInfo {
            executor_id: ExecutorId::new(task.task_id.as_str()),
            framework_id: Some(self.id.clone()),
            name: Some(name),
            command,
            resources: Resources::default(),
            source: Some(task.task_id.to_string()),
        }
    }

    /// Create a new executor run: assign a fresh run uuid and create the
    /// work directory (with its `latest` symlink).
    pub fn create_executor(
        &mut self,
        agent_id: &AgentId,
        work_dir: &Path,
        info: ExecutorInfo,
        command_executor: bool,
    ) -> AgentResult<RunUuid> {
        let run_uuid = RunUuid::random();
        let executor_id = info.executor_id.clone();
        let directory = paths::create_executor_directory(
            work_dir,
            agent_id,
            &self.id,
            &executor_id,
            &run_uuid,
        )?;
        let executor = Executor::new(
            self.id.clone(),
            info,
            run_uuid,
            directory,
            self.info.checkpoint_enabled,
            command_executor,
        );
        self.executors.insert(executor_id, executor);
        Ok(run_uuid)
    }

    /// Move an executor into the completed ring.
    pub fn destroy_executor(&mut self, executor_id: &ExecutorId) {
        if let Some(executor) = self.executors.remove(executor_id) {
            push_bounded(
                &mut self.completed_executors,
                executor,
                MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK,
            );
        }
    }

    pub fn get_executor(&self, executor_id: &ExecutorId) -> Option<&Executor> {
        self.executors.get(executor_id)
    }

    pub fn get_executor_mut(&mut self, executor_id: &ExecutorId) -> Option<&mut Executor> {
        self.executors.get_mut(executor_id)
    }

    /// The executor tracking a task, searched across queued, launched, and
    /// pending-acknowledgement state.
    pub fn get_executor_by_task(&self, task_id: &TaskId) -> Option<&Executor> {
        self.executors.values().find(|executor| {
            executor.queued_tasks.contains_key(task_id)
                || executor.launched_tasks.contains_key(task_id)
                || executor.updates.contains_key(task_id)
        })
    }

    pub fn get_executor_by_task_mut(&mut self, task_id: &TaskId) -> Option<&mut Executor> {
        self.executors.values_mut().find(|executor| {
            executor.queued_tasks.contains_key(task_id)
                || executor.launched_tasks.contains_key(task_id)
                || executor.updates.contains_key(task_id)
        })
    }

    /// Rebuild an executor from its recovered state. Only the latest run is
    /// resurrected; executors without a recoverable info or run are skipped.
    pub fn recover_executor(
        &mut self,
        agent_id: &AgentId,
        work_dir: &Path,
        state: &RecoveredExecutor,
    ) -> Option<&mut Executor> {
        let Some(info) = &state.info else {
            warn!(
                "skipping recovery of executor '{}' of framework {} \
                 because its info cannot be recovered",
                state.id, self.id
            );
            return None;
        };
        let Some(run) = state.latest_run() else {
            warn!(
                "skipping recovery of executor '{}' of framework {} \
                 because its latest run cannot be recovered",
                state.id, self.id
            );
            return None;
        };
        let directory = paths::run_dir(work_dir, agent_id, &self.id, &state.id, &run.run_uuid);
        let mut executor = Executor::new(
            self.id.clone(),
            info.clone(),
            run.run_uuid,
            directory,
            self.info.checkpoint_enabled,
            info.source.as_deref() == Some(state.id.as_str()),
        );
        executor.recovered_pid = run.libprocess_pid.clone();
        executor.forked_pid = run.forked_pid;
        for task in run.tasks.values() {
            executor.recover_task(task);
        }
        let executor_id = state.id.clone();
        self.executors.insert(executor_id.clone(), executor);
        self.executors.get_mut(&executor_id)
    }
}

/// One run of an executor: its queued and launched tasks, the updates still
/// awaiting coordinator acknowledgement, and the aggregate resources.
#[derive(Debug)]
pub struct Executor {
    pub id: ExecutorId,
    pub framework_id: FrameworkId,
    pub info: ExecutorInfo,
    pub run_uuid: RunUuid,
    pub directory: PathBuf,
    pub state: ExecutorState,
    pub checkpoint_enabled: bool,
    pub command_executor: bool,
    /// The executor endpoint; set while the executor is registered
    /// (running or terminating), absent otherwise.
    pub pid: Option<ExecutorHandle>,
    /// The libprocess pid recovered from a checkpoint, used to ask the
    /// executor to reconnect before it re-registers.
    pub recovered_pid: Option<String>,
    pub forked_pid: Option<u32>,
    pub queued_tasks: HashMap<TaskId, TaskInfo>,
    pub launched_tasks: HashMap<TaskId, Task>,
    /// Original task descriptions for launched tasks still staging, kept so
    /// they can be re-sent if the executor re-registers without them.
    pub staged: HashMap<TaskId, TaskInfo>,
    pub completed_tasks: VecDeque<Task>,
    /// Pending acknowledgements per task.
    pub updates: HashMap<TaskId, HashSet<UpdateUuid>>,
    pub resources: Resources,
}

impl Executor {
    pub fn new(
        framework_id: FrameworkId,
        info: ExecutorInfo,
        run_uuid: RunUuid,
        directory: PathBuf,
        checkpoint_enabled: bool,
        command_executor: bool,
    ) -> Self {
        let resources = info.resources.clone();
        Self {
            id: info.executor_id.clone(),
            framework_id,
            info,
            run_uuid,
            directory,
            state: ExecutorState::Registering,
            checkpoint_enabled,
            command_executor,
            pid: None,
            recovered_pid: None,
            forked_pid: None,
            queued_tasks: HashMap::new(),
            launched_tasks: HashMap::new(),
            staged: HashMap::new(),
            completed_tasks: VecDeque::new(),
            updates: HashMap::new(),
            resources,
        }
    }

    /// Move a task into the launched set and account its resources.
    /// Task ids must be unique across queued and launched tasks.
    pub fn add_task(&mut self, task: &TaskInfo) {
        if self.launched_tasks.contains_key(&task.task_id) {
            warn!(
                "not adding duplicate task {} to executor '{}'",
                task.task_id, self.id
            );
            return;
        }
        let tracked =
            Task::from_task_info(task, TaskState::Staging, &self.id, &self.framework_id);
        self.launched_tasks.insert(task.task_id.clone(), tracked);
        self.staged.insert(task.task_id.clone(), task.clone());
        self.resources += &task.resources;
    }

    /// Drop a task from queued or launched state; a launched task moves to
    /// the completed ring and releases its resources.
    pub fn remove_task(&mut self, task_id: &TaskId) {
        self.queued_tasks.remove(task_id);
        self.staged.remove(task_id);
        if let Some(task) = self.launched_tasks.remove(task_id) {
            self.resources -= &task.resources;
            push_bounded(
                &mut self.completed_tasks,
                task,
                MAX_COMPLETED_TASKS_PER_EXECUTOR,
            );
        }
    }

    pub fn update_task_state(&mut self, task_id: &TaskId, state: TaskState) {
        if state != TaskState::Staging {
            self.staged.remove(task_id);
        }
        if let Some(task) = self.launched_tasks.get_mut(task_id) {
            task.state = state;
        }
    }

    pub fn add_update(&mut self, task_id: &TaskId, uuid: UpdateUuid) {
        self.updates.entry(task_id.clone()).or_default().insert(uuid);
    }

    pub fn remove_update(&mut self, task_id: &TaskId, uuid: &UpdateUuid) {
        if let Some(uuids) = self.updates.get_mut(task_id) {
            uuids.remove(uuid);
            if uuids.is_empty() {
                self.updates.remove(task_id);
            }
        }
    }

    pub fn contains_update(&self, task_id: &TaskId, uuid: &UpdateUuid) -> bool {
        self.updates
            .get(task_id)
            .is_some_and(|uuids| uuids.contains(uuid))
    }

    pub fn updates_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Launched tasks that have not reached a terminal state.
    pub fn live_tasks(&self) -> Vec<&Task> {
        self.launched_tasks
            .values()
            .filter(|task| !task.state.is_terminal())
            .collect()
    }

    /// The executor process is gone; no endpoint remains to talk to.
    pub fn mark_terminated(&mut self) {
        self.state = ExecutorState::Terminated;
        self.pid = None;
        self.recovered_pid = None;
    }

    /// Reconstruct one task of a recovered run: replay its checkpointed
    /// updates to find the latest state, dropping it if it terminated and
    /// the terminal update was acknowledged.
    pub fn recover_task(&mut self, state: &RecoveredTask) {
        let Some(info) = &state.info else {
            warn!(
                "skipping recovery of task {} because its info cannot be recovered",
                state.id
            );
            return;
        };
        self.launched_tasks.insert(state.id.clone(), info.clone());
        if let Some(task_info) = &info.info {
            self.staged.insert(state.id.clone(), task_info.clone());
        }
        // This is an upper bound: tasks that terminated while the agent was
        // down are subtracted again below.
        self.resources += &info.resources;
        for update in &state.updates {
            self.update_task_state(&state.id, update.state());
            self.add_update(&state.id, update.uuid);
            if update.state().is_terminal() {
                self.remove_task(&state.id);
                if state.acks.contains(&update.uuid) {
                    self.remove_update(&state.id, &update.uuid);
                }
                break;
            }
        }
    }
}
