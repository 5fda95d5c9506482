use std::path::{Path, PathBuf};

use keel_server::actor::ActorHandle;
use log::warn;

use crate::agent::{AgentActor, AgentEvent};
use crate::checkpoint::AgentState;
use crate::error::AgentResult;
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid};
use crate::message::{ExecutorInfo, FrameworkInfo};
use crate::resources::Resources;

/// How the agent reaches back into the actor from isolation callbacks.
#[derive(Clone)]
pub struct IsolationSink {
    handle: ActorHandle<AgentActor>,
}

impl IsolationSink {
    pub fn new(handle: ActorHandle<AgentActor>) -> Self {
        Self { handle }
    }

    /// The executor process has been forked.
    pub async fn executor_started(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        forked_pid: u32,
    ) {
        let event = AgentEvent::ExecutorStarted {
            framework_id,
            executor_id,
            forked_pid,
        };
        if let Err(e) = self.handle.send(event).await {
            warn!("failed to report executor start: {e}");
        }
    }

    /// The executor process has been reaped.
    pub async fn executor_terminated(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        exit_status: i32,
        destroyed: bool,
        message: String,
    ) {
        let event = AgentEvent::ExecutorTerminated {
            framework_id,
            executor_id,
            exit_status,
            destroyed,
            message,
        };
        if let Err(e) = self.handle.send(event).await {
            warn!("failed to report executor termination: {e}");
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsolationOptions {
    pub work_dir: PathBuf,
    pub resources: Resources,
}

/// The capability to launch, resource-adjust, kill, and reap executor
/// processes. Production drivers (process trees, control groups) live
/// outside this crate; the agent only depends on this contract.
#[async_trait::async_trait]
pub trait IsolationDriver: Send + Sync + 'static {
    async fn initialize(&self, options: &IsolationOptions, sink: IsolationSink)
        -> AgentResult<()>;

    #[allow(clippy::too_many_arguments)]
    async fn launch_executor(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        framework_info: &FrameworkInfo,
        executor_info: &ExecutorInfo,
        run_uuid: &RunUuid,
        work_dir: &Path,
        resources: &Resources,
    ) -> AgentResult<()>;

    /// The executor's resource envelope changed (tasks added or removed).
    async fn resources_changed(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resources: &Resources,
    ) -> AgentResult<()>;

    async fn kill_executor(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> AgentResult<()>;

    /// Reconcile with executors that survived an agent restart. A `None`
    /// state means there is nothing to reconnect to and stale isolates
    /// should be swept.
    async fn recover(&self, state: Option<&AgentState>) -> AgentResult<()>;

    async fn terminate(&self) -> AgentResult<()>;
}
