use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_server::actor::ActorHandle;
use tempfile::TempDir;

use crate::agent::{AgentActor, AgentEvent, AgentOptions, RecoverMode};
use crate::checkpoint::store::UpdateLogRecord;
use crate::checkpoint::{paths, store, AgentState};
use crate::error::AgentResult;
use crate::files::NullFileServer;
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid, TaskId, UpdateUuid};
use crate::isolation::{IsolationDriver, IsolationOptions, IsolationSink};
use crate::message::{
    AgentInfo, CommandInfo, CoordinatorClient, CoordinatorHandle, ExecutorClient,
    ExecutorHandle, ExecutorInfo, ExecutorPidResolver, FrameworkInfo, StatusSource,
    StatusUpdate, Task, TaskInfo, TaskState,
};
use crate::metrics::Metrics;
use crate::monitor::{ResourceUsage, UsageCollector};
use crate::resources::Resources;

#[derive(Debug, Clone)]
enum CoordinatorMessage {
    Register,
    Reregister { executors: usize, tasks: usize },
    Update(StatusUpdate),
    ExitedExecutor { executor_id: ExecutorId, status: i32 },
    FrameworkMessage(Vec<u8>),
    Pong,
}

#[derive(Default)]
struct MockCoordinator {
    messages: Mutex<Vec<CoordinatorMessage>>,
}

impl MockCoordinator {
    fn push(&self, message: CoordinatorMessage) {
        self.messages.lock().unwrap().push(message);
    }

    fn updates(&self) -> Vec<StatusUpdate> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                CoordinatorMessage::Update(u) => Some(u.clone()),
                _ => None,
            })
            .collect()
    }

    fn count<F: Fn(&CoordinatorMessage) -> bool>(&self, f: F) -> usize {
        self.messages.lock().unwrap().iter().filter(|m| f(m)).count()
    }
}

#[async_trait::async_trait]
impl CoordinatorClient for MockCoordinator {
    async fn register_agent(&self, _info: &AgentInfo) -> AgentResult<()> {
        self.push(CoordinatorMessage::Register);
        Ok(())
    }

    async fn reregister_agent(
        &self,
        _agent_id: &AgentId,
        _info: &AgentInfo,
        executor_infos: &[ExecutorInfo],
        tasks: &[Task],
    ) -> AgentResult<()> {
        self.push(CoordinatorMessage::Reregister {
            executors: executor_infos.len(),
            tasks: tasks.len(),
        });
        Ok(())
    }

    async fn status_update(&self, update: &StatusUpdate) -> AgentResult<()> {
        self.push(CoordinatorMessage::Update(update.clone()));
        Ok(())
    }

    async fn exited_executor(
        &self,
        _agent_id: &AgentId,
        _framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        exit_status: i32,
    ) -> AgentResult<()> {
        self.push(CoordinatorMessage::ExitedExecutor {
            executor_id: executor_id.clone(),
            status: exit_status,
        });
        Ok(())
    }

    async fn executor_to_framework(
        &self,
        _framework_pid: &str,
        _agent_id: &AgentId,
        _framework_id: &FrameworkId,
        _executor_id: &ExecutorId,
        data: &[u8],
    ) -> AgentResult<()> {
        self.push(CoordinatorMessage::FrameworkMessage(data.to_vec()));
        Ok(())
    }

    async fn pong(&self) -> AgentResult<()> {
        self.push(CoordinatorMessage::Pong);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ExecutorMessage {
    Registered,
    Reregistered,
    RunTask(TaskId),
    KillTask(TaskId),
    Ack(TaskId, UpdateUuid),
    FrameworkMessage(Vec<u8>),
    Shutdown,
    Reconnect,
}

#[derive(Default)]
struct MockExecutorClient {
    messages: Mutex<Vec<ExecutorMessage>>,
}

impl MockExecutorClient {
    fn push(&self, message: ExecutorMessage) {
        self.messages.lock().unwrap().push(message);
    }

    fn contains(&self, message: &ExecutorMessage) -> bool {
        self.messages.lock().unwrap().iter().any(|m| m == message)
    }
}

#[async_trait::async_trait]
impl ExecutorClient for MockExecutorClient {
    async fn executor_registered(
        &self,
        _executor_info: &ExecutorInfo,
        _framework_id: &FrameworkId,
        _framework_info: &FrameworkInfo,
        _agent_id: &AgentId,
        _agent_info: &AgentInfo,
    ) -> AgentResult<()> {
        self.push(ExecutorMessage::Registered);
        Ok(())
    }

    async fn executor_reregistered(
        &self,
        _agent_id: &AgentId,
        _agent_info: &AgentInfo,
    ) -> AgentResult<()> {
        self.push(ExecutorMessage::Reregistered);
        Ok(())
    }

    async fn run_task(
        &self,
        _framework_info: &FrameworkInfo,
        _framework_id: &FrameworkId,
        _framework_pid: &str,
        task: &TaskInfo,
    ) -> AgentResult<()> {
        self.push(ExecutorMessage::RunTask(task.task_id.clone()));
        Ok(())
    }

    async fn kill_task(&self, _framework_id: &FrameworkId, task_id: &TaskId) -> AgentResult<()> {
        self.push(ExecutorMessage::KillTask(task_id.clone()));
        Ok(())
    }

    async fn status_update_acknowledgement(
        &self,
        _agent_id: &AgentId,
        _framework_id: &FrameworkId,
        task_id: &TaskId,
        uuid: &UpdateUuid,
    ) -> AgentResult<()> {
        self.push(ExecutorMessage::Ack(task_id.clone(), *uuid));
        Ok(())
    }

    async fn framework_to_executor(
        &self,
        _agent_id: &AgentId,
        _framework_id: &FrameworkId,
        _executor_id: &ExecutorId,
        data: &[u8],
    ) -> AgentResult<()> {
        self.push(ExecutorMessage::FrameworkMessage(data.to_vec()));
        Ok(())
    }

    async fn shutdown_executor(&self) -> AgentResult<()> {
        self.push(ExecutorMessage::Shutdown);
        Ok(())
    }

    async fn reconnect_executor(&self, _agent_id: &AgentId) -> AgentResult<()> {
        self.push(ExecutorMessage::Reconnect);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum IsolationCall {
    Initialize,
    Launch {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ResourcesChanged {
        executor_id: ExecutorId,
        cpus: f64,
    },
    Kill {
        executor_id: ExecutorId,
    },
    Recover {
        with_state: bool,
    },
    Terminate,
}

#[derive(Default)]
struct MockIsolation {
    calls: Mutex<Vec<IsolationCall>>,
}

impl MockIsolation {
    fn push(&self, call: IsolationCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn contains<F: Fn(&IsolationCall) -> bool>(&self, f: F) -> bool {
        self.calls.lock().unwrap().iter().any(|c| f(c))
    }
}

#[async_trait::async_trait]
impl IsolationDriver for MockIsolation {
    async fn initialize(
        &self,
        _options: &IsolationOptions,
        _sink: IsolationSink,
    ) -> AgentResult<()> {
        self.push(IsolationCall::Initialize);
        Ok(())
    }

    async fn launch_executor(
        &self,
        _agent_id: &AgentId,
        framework_id: &FrameworkId,
        _framework_info: &FrameworkInfo,
        executor_info: &ExecutorInfo,
        _run_uuid: &RunUuid,
        _work_dir: &std::path::Path,
        _resources: &Resources,
    ) -> AgentResult<()> {
        self.push(IsolationCall::Launch {
            framework_id: framework_id.clone(),
            executor_id: executor_info.executor_id.clone(),
        });
        Ok(())
    }

    async fn resources_changed(
        &self,
        _framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resources: &Resources,
    ) -> AgentResult<()> {
        self.push(IsolationCall::ResourcesChanged {
            executor_id: executor_id.clone(),
            cpus: resources.cpus,
        });
        Ok(())
    }

    async fn kill_executor(
        &self,
        _framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> AgentResult<()> {
        self.push(IsolationCall::Kill {
            executor_id: executor_id.clone(),
        });
        Ok(())
    }

    async fn recover(&self, state: Option<&AgentState>) -> AgentResult<()> {
        self.push(IsolationCall::Recover {
            with_state: state.is_some(),
        });
        Ok(())
    }

    async fn terminate(&self) -> AgentResult<()> {
        self.push(IsolationCall::Terminate);
        Ok(())
    }
}

struct NullUsageCollector;

#[async_trait::async_trait]
impl UsageCollector for NullUsageCollector {
    async fn usage(
        &self,
        _framework_id: &FrameworkId,
        _executor_id: &ExecutorId,
    ) -> AgentResult<ResourceUsage> {
        Ok(ResourceUsage::default())
    }
}

/// Hands out pre-registered executor endpoints by pid.
#[derive(Default)]
struct StubResolver {
    handles: Mutex<std::collections::HashMap<String, ExecutorHandle>>,
}

impl StubResolver {
    fn register(&self, handle: ExecutorHandle) {
        self.handles
            .lock()
            .unwrap()
            .insert(handle.pid.clone(), handle);
    }
}

impl ExecutorPidResolver for StubResolver {
    fn connect(&self, pid: &str) -> AgentResult<ExecutorHandle> {
        self.handles
            .lock()
            .unwrap()
            .get(pid)
            .cloned()
            .ok_or_else(|| {
                crate::error::AgentError::InternalError(format!("unknown pid {pid}"))
            })
    }
}

const MASTER_PID: &str = "master@10.0.0.1:5050";
const SCHEDULER_PID: &str = "scheduler@10.0.0.2:8080";

struct Harness {
    handle: ActorHandle<AgentActor>,
    coordinator: Arc<MockCoordinator>,
    coordinator_handle: CoordinatorHandle,
    isolation: Arc<MockIsolation>,
    metrics: Arc<Metrics>,
    _temp: TempDir,
}

fn agent_options(
    temp: &TempDir,
    checkpoint: bool,
    recover_mode: RecoverMode,
    isolation: Arc<MockIsolation>,
    resolver: Arc<StubResolver>,
) -> AgentOptions {
    AgentOptions {
        work_dir: temp.path().to_path_buf(),
        hostname: "localhost".to_string(),
        webui_hostname: "localhost".to_string(),
        checkpoint,
        recover_mode,
        safe: true,
        resources: Resources::agent_defaults(),
        attributes: BTreeMap::new(),
        gc_delay: Duration::from_secs(7 * 24 * 3600),
        disk_watch_interval: Duration::from_secs(3600),
        executor_registration_timeout: Duration::from_secs(60),
        executor_shutdown_grace_period: Duration::from_millis(300),
        resource_monitoring_interval: Duration::from_secs(60),
        launcher_dir: temp.path().to_path_buf(),
        log_dir: None,
        update_retry: keel_server::retry::RetryStrategy::ExponentialBackoff {
            initial_delay: Duration::from_secs(600),
            max_delay: Duration::from_secs(600),
            factor: 2,
        },
        isolation,
        files: Arc::new(NullFileServer),
        usage_collector: Arc::new(NullUsageCollector),
        executor_resolver: resolver,
        metrics: Arc::new(Metrics::new()),
    }
}

fn harness(checkpoint: bool, recover_mode: RecoverMode) -> Harness {
    let temp = TempDir::new().unwrap();
    harness_in(temp, checkpoint, recover_mode, Arc::new(StubResolver::default()))
}

fn harness_in(
    temp: TempDir,
    checkpoint: bool,
    recover_mode: RecoverMode,
    resolver: Arc<StubResolver>,
) -> Harness {
    let isolation = Arc::new(MockIsolation::default());
    let options = agent_options(
        &temp,
        checkpoint,
        recover_mode,
        isolation.clone(),
        resolver.clone(),
    );
    let metrics = options.metrics.clone();
    let coordinator = Arc::new(MockCoordinator::default());
    let coordinator_handle = CoordinatorHandle {
        pid: MASTER_PID.to_string(),
        client: coordinator.clone(),
    };
    let handle = ActorHandle::<AgentActor>::new(options);
    Harness {
        handle,
        coordinator,
        coordinator_handle,
        isolation,
        metrics,
        _temp: temp,
    }
}

impl Harness {
    async fn register(&self, agent_id: &str) {
        self.handle
            .send(AgentEvent::NewCoordinatorDetected {
                coordinator: self.coordinator_handle.clone(),
            })
            .await
            .unwrap();
        eventually(|| self.coordinator.count(|m| matches!(m, CoordinatorMessage::Register)) > 0)
            .await;
        self.handle
            .send(AgentEvent::AgentRegistered {
                agent_id: AgentId::new(agent_id),
            })
            .await
            .unwrap();
    }
}

async fn eventually<F: Fn() -> bool>(f: F) {
    for _ in 0..400 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met in time");
}

fn framework_info(checkpoint: bool) -> FrameworkInfo {
    FrameworkInfo {
        framework_id: Some(FrameworkId::new("f1")),
        user: "alice".to_string(),
        name: "batch".to_string(),
        checkpoint_enabled: checkpoint,
        failover_timeout: None,
    }
}

fn executor_info(id: &str) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: ExecutorId::new(id),
        framework_id: Some(FrameworkId::new("f1")),
        name: None,
        command: CommandInfo::shell("./executor"),
        resources: Resources {
            cpus: 0.1,
            mem: 32,
            disk: 0,
            ports: vec![],
        },
        source: None,
    }
}

fn task_info(id: &str) -> TaskInfo {
    TaskInfo {
        task_id: TaskId::new(id),
        name: id.to_string(),
        resources: Resources {
            cpus: 1.0,
            mem: 128,
            disk: 0,
            ports: vec![],
        },
        executor: Some(executor_info("e1")),
        command: None,
        data: vec![],
    }
}

fn run_task_event(checkpoint: bool, id: &str) -> AgentEvent {
    AgentEvent::RunTask {
        framework_info: framework_info(checkpoint),
        framework_id: FrameworkId::new("f1"),
        coordinator_pid: SCHEDULER_PID.to_string(),
        task: task_info(id),
    }
}

fn executor_update(agent_id: &str, task: &str, state: TaskState) -> StatusUpdate {
    StatusUpdate::new(
        FrameworkId::new("f1"),
        Some(AgentId::new(agent_id)),
        TaskId::new(task),
        state,
        StatusSource::Executor,
        None,
        None,
        Some(ExecutorId::new("e1")),
    )
}

fn executor_endpoint(pid: &str) -> (ExecutorHandle, Arc<MockExecutorClient>) {
    let client = Arc::new(MockExecutorClient::default());
    (
        ExecutorHandle {
            pid: pid.to_string(),
            client: client.clone(),
        },
        client,
    )
}

async fn ack(handle: &ActorHandle<AgentActor>, agent_id: &str, task: &str, uuid: UpdateUuid) {
    handle
        .send(AgentEvent::StatusUpdateAcknowledgement {
            agent_id: AgentId::new(agent_id),
            framework_id: FrameworkId::new("f1"),
            task_id: TaskId::new(task),
            uuid,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_happy_task_lifecycle() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    harness.handle.send(run_task_event(false, "t1")).await.unwrap();
    eventually(|| {
        harness
            .isolation
            .contains(|c| matches!(c, IsolationCall::Launch { executor_id, .. } if executor_id.as_str() == "e1"))
    })
    .await;

    let (endpoint, executor) = executor_endpoint("executor@10.0.0.3:40000");
    harness
        .handle
        .send(AgentEvent::RegisterExecutor {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::Registered)).await;
    eventually(|| executor.contains(&ExecutorMessage::RunTask(TaskId::new("t1")))).await;

    // RUNNING followed by FINISHED; the second update stays queued until the
    // first is acknowledged.
    let running = executor_update("a1", "t1", TaskState::Running);
    let finished = executor_update("a1", "t1", TaskState::Finished);
    harness
        .handle
        .send(AgentEvent::StatusUpdate {
            update: running.clone(),
        })
        .await
        .unwrap();
    harness
        .handle
        .send(AgentEvent::StatusUpdate {
            update: finished.clone(),
        })
        .await
        .unwrap();

    eventually(|| !harness.coordinator.updates().is_empty()).await;
    eventually(|| executor.contains(&ExecutorMessage::Ack(TaskId::new("t1"), running.uuid)))
        .await;
    assert_eq!(
        harness
            .coordinator
            .updates()
            .iter()
            .map(|u| u.uuid)
            .collect::<Vec<_>>(),
        vec![running.uuid]
    );

    ack(&harness.handle, "a1", "t1", running.uuid).await;
    eventually(|| harness.coordinator.updates().len() == 2).await;
    assert_eq!(
        harness
            .coordinator
            .updates()
            .iter()
            .map(|u| u.uuid)
            .collect::<Vec<_>>(),
        vec![running.uuid, finished.uuid]
    );
    ack(&harness.handle, "a1", "t1", finished.uuid).await;

    harness
        .handle
        .send(AgentEvent::ExecutorTerminated {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            exit_status: 0,
            destroyed: false,
            message: "executor exited".to_string(),
        })
        .await
        .unwrap();
    eventually(|| {
        harness.coordinator.count(|m| {
            matches!(m, CoordinatorMessage::ExitedExecutor { executor_id, status }
                if executor_id.as_str() == "e1" && *status == 0)
        }) > 0
    })
    .await;
    // The task terminated cleanly before the executor, so no synthesized
    // updates flow.
    assert_eq!(harness.coordinator.updates().len(), 2);
}

#[tokio::test]
async fn test_checkpoint_mismatch_rejects_task() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    harness.handle.send(run_task_event(true, "t2")).await.unwrap();
    eventually(|| !harness.coordinator.updates().is_empty()).await;

    let updates = harness.coordinator.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].state(), TaskState::Lost);
    assert!(updates[0]
        .status
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("checkpointing"));
    assert!(!harness
        .isolation
        .contains(|c| matches!(c, IsolationCall::Launch { .. })));
}

#[tokio::test]
async fn test_executor_crash_fails_live_tasks() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    harness.handle.send(run_task_event(false, "t3")).await.unwrap();
    let (endpoint, executor) = executor_endpoint("executor@10.0.0.3:40001");
    harness
        .handle
        .send(AgentEvent::RegisterExecutor {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::RunTask(TaskId::new("t3")))).await;

    let running = executor_update("a1", "t3", TaskState::Running);
    harness
        .handle
        .send(AgentEvent::StatusUpdate {
            update: running.clone(),
        })
        .await
        .unwrap();
    eventually(|| harness.coordinator.updates().len() == 1).await;
    ack(&harness.handle, "a1", "t3", running.uuid).await;

    harness
        .handle
        .send(AgentEvent::ExecutorTerminated {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            exit_status: 137,
            destroyed: true,
            message: "memory limit exceeded".to_string(),
        })
        .await
        .unwrap();

    // The isolation layer destroyed the executor, so the live task failed
    // rather than getting lost.
    eventually(|| harness.coordinator.updates().len() == 2).await;
    let failed = &harness.coordinator.updates()[1];
    assert_eq!(failed.state(), TaskState::Failed);
    assert_eq!(failed.task_id().as_str(), "t3");
    assert_eq!(
        failed.status.message.as_deref(),
        Some("memory limit exceeded")
    );
    eventually(|| {
        harness.coordinator.count(|m| {
            matches!(m, CoordinatorMessage::ExitedExecutor { status, .. } if *status == 137)
        }) > 0
    })
    .await;
    ack(&harness.handle, "a1", "t3", failed.uuid).await;
}

#[tokio::test]
async fn test_recovery_reconnect_rebuilds_and_relaunches() {
    let temp = TempDir::new().unwrap();
    let root = paths::meta_root_dir(temp.path());
    let agent_id = AgentId::new("a1");
    let framework_id = FrameworkId::new("f1");
    let executor_id = ExecutorId::new("e1");
    let run_uuid = RunUuid::random();
    let executor_pid = "executor@10.0.0.3:40002";

    // Pre-state: a checkpointed framework with one executor run carrying a
    // running task t4 (update unacknowledged) and a staging task t5.
    let info = AgentInfo {
        id: Some(agent_id.clone()),
        hostname: "localhost".to_string(),
        webui_hostname: "localhost".to_string(),
        resources: Resources::agent_defaults(),
        attributes: BTreeMap::new(),
        checkpoint_enabled: true,
    };
    store::checkpoint(&paths::agent_info_path(&root, &agent_id), &info).unwrap();
    store::checkpoint(
        &paths::framework_info_path(&root, &agent_id, &framework_id),
        &framework_info(true),
    )
    .unwrap();
    store::checkpoint(
        &paths::framework_pid_path(&root, &agent_id, &framework_id),
        &SCHEDULER_PID.to_string(),
    )
    .unwrap();
    store::checkpoint(
        &paths::executor_info_path(&root, &agent_id, &framework_id, &executor_id),
        &executor_info("e1"),
    )
    .unwrap();
    paths::create_executor_directory(&root, &agent_id, &framework_id, &executor_id, &run_uuid)
        .unwrap();
    store::checkpoint(
        &paths::libprocess_pid_path(&root, &agent_id, &framework_id, &executor_id, &run_uuid),
        &executor_pid.to_string(),
    )
    .unwrap();
    for task in ["t4", "t5"] {
        let record = Task::from_task_info(
            &task_info(task),
            TaskState::Staging,
            &executor_id,
            &framework_id,
        );
        store::checkpoint(
            &paths::task_info_path(
                &root,
                &agent_id,
                &framework_id,
                &executor_id,
                &run_uuid,
                &TaskId::new(task),
            ),
            &record,
        )
        .unwrap();
    }
    let running = executor_update("a1", "t4", TaskState::Running);
    store::append_update(
        &paths::task_updates_path(
            &root,
            &agent_id,
            &framework_id,
            &executor_id,
            &run_uuid,
            &TaskId::new("t4"),
        ),
        &UpdateLogRecord::Update(running.clone()),
    )
    .unwrap();

    let resolver = Arc::new(StubResolver::default());
    let (endpoint, executor) = executor_endpoint(executor_pid);
    resolver.register(endpoint.clone());
    let harness = harness_in(temp, true, RecoverMode::Reconnect, resolver);

    // The executor that survived the restart is asked to reconnect.
    eventually(|| executor.contains(&ExecutorMessage::Reconnect)).await;
    assert!(harness
        .isolation
        .contains(|c| matches!(c, IsolationCall::Recover { with_state: true })));

    harness
        .handle
        .send(AgentEvent::ReregisterExecutor {
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            tasks: vec![task_info("t4")],
            updates: vec![running.clone()],
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::Reregistered)).await;

    // t5 never reached the executor, so it is relaunched; t4 is not.
    eventually(|| executor.contains(&ExecutorMessage::RunTask(TaskId::new("t5")))).await;
    assert!(!executor.contains(&ExecutorMessage::RunTask(TaskId::new("t4"))));

    // The coordinator learns about the recovered executor and its tasks,
    // and receives the replayed pending update exactly once.
    harness
        .handle
        .send(AgentEvent::NewCoordinatorDetected {
            coordinator: harness.coordinator_handle.clone(),
        })
        .await
        .unwrap();
    eventually(|| {
        harness
            .coordinator
            .count(|m| matches!(m, CoordinatorMessage::Reregister { .. }))
            > 0
    })
    .await;
    eventually(|| !harness.coordinator.updates().is_empty()).await;
    let updates = harness.coordinator.updates();
    assert_eq!(updates.iter().map(|u| u.uuid).collect::<Vec<_>>(), vec![running.uuid]);
    assert!(harness.coordinator.count(|m| {
        matches!(m, CoordinatorMessage::Reregister { executors, tasks }
            if *executors == 1 && *tasks == 2)
    }) > 0);
}

#[tokio::test]
async fn test_shutdown_framework_kills_after_grace_period() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    harness.handle.send(run_task_event(false, "t6")).await.unwrap();
    let (endpoint, executor) = executor_endpoint("executor@10.0.0.3:40003");
    harness
        .handle
        .send(AgentEvent::RegisterExecutor {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::RunTask(TaskId::new("t6")))).await;

    harness
        .handle
        .send(AgentEvent::ShutdownFramework {
            framework_id: FrameworkId::new("f1"),
            from: Some(MASTER_PID.to_string()),
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::Shutdown)).await;

    // The executor ignores the shutdown; after the grace period the
    // isolation driver is asked to kill it.
    eventually(|| {
        harness
            .isolation
            .contains(|c| matches!(c, IsolationCall::Kill { executor_id } if executor_id.as_str() == "e1"))
    })
    .await;

    harness
        .handle
        .send(AgentEvent::ExecutorTerminated {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            exit_status: 137,
            destroyed: false,
            message: "killed".to_string(),
        })
        .await
        .unwrap();
    // The framework is terminating, so no updates are synthesized for the
    // live task.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.coordinator.updates().is_empty());
}

#[tokio::test]
async fn test_shutdown_framework_from_unknown_sender_is_ignored() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    harness.handle.send(run_task_event(false, "t7")).await.unwrap();
    let (endpoint, executor) = executor_endpoint("executor@10.0.0.3:40004");
    harness
        .handle
        .send(AgentEvent::RegisterExecutor {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::Registered)).await;

    harness
        .handle
        .send(AgentEvent::ShutdownFramework {
            framework_id: FrameworkId::new("f1"),
            from: Some("impostor@10.9.9.9:1".to_string()),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!executor.contains(&ExecutorMessage::Shutdown));
}

#[tokio::test]
async fn test_duplicate_acknowledgement_is_counted_and_dropped() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    harness.handle.send(run_task_event(false, "t8")).await.unwrap();
    let (endpoint, executor) = executor_endpoint("executor@10.0.0.3:40005");
    harness
        .handle
        .send(AgentEvent::RegisterExecutor {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::RunTask(TaskId::new("t8")))).await;

    let running = executor_update("a1", "t8", TaskState::Running);
    harness
        .handle
        .send(AgentEvent::StatusUpdate {
            update: running.clone(),
        })
        .await
        .unwrap();
    eventually(|| harness.coordinator.updates().len() == 1).await;

    ack(&harness.handle, "a1", "t8", running.uuid).await;
    ack(&harness.handle, "a1", "t8", running.uuid).await;

    eventually(|| harness.metrics.invalid_status_updates.load(Ordering::Relaxed) == 1).await;
    // The second acknowledgement changed nothing; a later update flows
    // through the same stream unharmed.
    let finished = executor_update("a1", "t8", TaskState::Finished);
    harness
        .handle
        .send(AgentEvent::StatusUpdate {
            update: finished.clone(),
        })
        .await
        .unwrap();
    eventually(|| harness.coordinator.updates().len() == 2).await;
}

#[tokio::test]
async fn test_kill_task_on_unregistered_executor() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    // The executor has not registered yet, so the task is queued.
    harness.handle.send(run_task_event(false, "t9")).await.unwrap();
    eventually(|| {
        harness
            .isolation
            .contains(|c| matches!(c, IsolationCall::Launch { .. }))
    })
    .await;

    harness
        .handle
        .send(AgentEvent::KillTask {
            framework_id: FrameworkId::new("f1"),
            task_id: TaskId::new("t9"),
        })
        .await
        .unwrap();
    eventually(|| !harness.coordinator.updates().is_empty()).await;
    let updates = harness.coordinator.updates();
    assert_eq!(updates[0].state(), TaskState::Killed);
    assert_eq!(
        updates[0].status.message.as_deref(),
        Some("Unregistered executor")
    );
}

#[tokio::test]
async fn test_framework_message_routing_guards() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;

    let message = |data: &[u8]| AgentEvent::FrameworkToExecutor {
        agent_id: AgentId::new("a1"),
        framework_id: FrameworkId::new("f1"),
        executor_id: ExecutorId::new("e1"),
        data: data.to_vec(),
    };

    // No such framework yet.
    harness.handle.send(message(b"one")).await.unwrap();
    eventually(|| harness.metrics.invalid_framework_messages.load(Ordering::Relaxed) == 1)
        .await;

    // The executor exists but has not registered: still dropped.
    harness.handle.send(run_task_event(false, "t10")).await.unwrap();
    harness.handle.send(message(b"two")).await.unwrap();
    eventually(|| harness.metrics.invalid_framework_messages.load(Ordering::Relaxed) == 2)
        .await;

    // Once the executor is running the message is relayed.
    let (endpoint, executor) = executor_endpoint("executor@10.0.0.3:40006");
    harness
        .handle
        .send(AgentEvent::RegisterExecutor {
            framework_id: FrameworkId::new("f1"),
            executor_id: ExecutorId::new("e1"),
            sender: endpoint,
        })
        .await
        .unwrap();
    eventually(|| executor.contains(&ExecutorMessage::Registered)).await;
    harness.handle.send(message(b"three")).await.unwrap();
    eventually(|| executor.contains(&ExecutorMessage::FrameworkMessage(b"three".to_vec())))
        .await;
    assert_eq!(
        harness.metrics.valid_framework_messages.load(Ordering::Relaxed),
        1
    );
    assert_eq!(
        harness.metrics.invalid_framework_messages.load(Ordering::Relaxed),
        2
    );
}

#[tokio::test]
async fn test_ping_pong() {
    let harness = harness(false, RecoverMode::Reconnect);
    harness.register("a1").await;
    harness.handle.send(AgentEvent::Ping).await.unwrap();
    eventually(|| harness.coordinator.count(|m| matches!(m, CoordinatorMessage::Pong)) > 0)
        .await;
}
