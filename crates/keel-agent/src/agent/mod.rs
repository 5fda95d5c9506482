mod core;
mod event;
mod handler;
mod options;
mod recovery;
mod state;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

pub use event::AgentEvent;
pub use options::{AgentOptions, RecoverMode};
pub use state::{Executor, ExecutorState, Framework, FrameworkState};

use crate::checkpoint::paths;
use crate::gc::GarbageCollector;
use crate::id::FrameworkId;
use crate::message::{AgentInfo, CoordinatorHandle};
use crate::monitor::ResourceMonitor;
use crate::update::UpdateManager;

/// The per-node agent runtime: one actor owning all framework, executor,
/// and task state, talking to the coordinator, the isolation layer, and the
/// executors it supervises.
pub struct AgentActor {
    pub(crate) options: AgentOptions,
    pub(crate) info: AgentInfo,
    pub(crate) frameworks: HashMap<FrameworkId, Framework>,
    pub(crate) completed_frameworks: VecDeque<Framework>,
    pub(crate) updates: UpdateManager,
    pub(crate) gc: GarbageCollector,
    pub(crate) monitor: ResourceMonitor,
    pub(crate) coordinator: Option<CoordinatorHandle>,
    pub(crate) connected: bool,
    /// Set once recovery has finished; registration waits for it.
    pub(crate) recovered: bool,
    /// A coordinator was detected before recovery finished; register as
    /// soon as it does.
    pub(crate) pending_registration: bool,
    /// A registration retry chain is active.
    pub(crate) registering: bool,
    pub(crate) halting: bool,
}

impl AgentActor {
    pub(crate) fn meta_root(&self) -> PathBuf {
        paths::meta_root_dir(&self.options.work_dir)
    }
}
