use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::warn;

use crate::checkpoint::store::UpdateLogRecord;
use crate::checkpoint::{paths, store};
use crate::error::{AgentError, AgentResult};
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid, TaskId, UpdateUuid};
use crate::message::{AgentInfo, ExecutorInfo, FrameworkInfo, StatusUpdate, Task};

/// The tree of state recovered from the checkpoint layout.
/// Missing optional records are represented as absent; corrupt records abort
/// the walk with a recovery error.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub agent_id: Option<AgentId>,
    pub info: Option<AgentInfo>,
    pub frameworks: HashMap<FrameworkId, RecoveredFramework>,
}

#[derive(Debug, Clone)]
pub struct RecoveredFramework {
    pub id: FrameworkId,
    pub info: Option<FrameworkInfo>,
    pub pid: Option<String>,
    pub executors: HashMap<ExecutorId, RecoveredExecutor>,
}

#[derive(Debug, Clone)]
pub struct RecoveredExecutor {
    pub id: ExecutorId,
    pub info: Option<ExecutorInfo>,
    /// The run selected by the `latest` symlink.
    pub latest: Option<RunUuid>,
    pub runs: HashMap<RunUuid, RecoveredRun>,
}

impl RecoveredExecutor {
    pub fn latest_run(&self) -> Option<&RecoveredRun> {
        self.latest.as_ref().and_then(|uuid| self.runs.get(uuid))
    }
}

#[derive(Debug, Clone)]
pub struct RecoveredRun {
    pub run_uuid: RunUuid,
    pub libprocess_pid: Option<String>,
    pub forked_pid: Option<u32>,
    pub tasks: HashMap<TaskId, RecoveredTask>,
}

#[derive(Debug, Clone)]
pub struct RecoveredTask {
    pub id: TaskId,
    pub info: Option<Task>,
    /// Updates in log order, with acknowledged ones still included.
    pub updates: Vec<StatusUpdate>,
    /// Update uuids the coordinator already acknowledged.
    pub acks: HashSet<UpdateUuid>,
}

/// Walk the checkpoint layout under `root` (the meta root directory) and
/// parse all records. Returns `None` when the layout does not exist, which
/// means this is the first checkpointed boot or the previous shutdown
/// cleaned up.
/// With `safe` set, a corrupt record aborts the walk; otherwise it is
/// treated as absent with a warning.
pub fn recover(root: &Path, safe: bool) -> AgentResult<Option<AgentState>> {
    if !root.exists() {
        return Ok(None);
    }
    let agents_dir = paths::agents_dir(root);
    let Some(agent_id) = find_agent_id(&agents_dir)? else {
        return Ok(Some(AgentState::default()));
    };
    let info = read_record(&paths::agent_info_path(root, &agent_id), safe)?;
    let mut state = AgentState {
        agent_id: Some(agent_id.clone()),
        info,
        frameworks: HashMap::new(),
    };
    for framework_id in list_dir(&paths::frameworks_dir(root, &agent_id))? {
        let framework_id = FrameworkId::new(framework_id);
        let framework = recover_framework(root, &agent_id, &framework_id, safe)?;
        state.frameworks.insert(framework_id, framework);
    }
    Ok(Some(state))
}

/// Read a record, downgrading parse failures to warnings in unsafe mode.
fn read_record<T: serde::de::DeserializeOwned>(
    path: &Path,
    safe: bool,
) -> AgentResult<Option<T>> {
    match store::read_record(path) {
        Ok(record) => Ok(record),
        Err(e @ AgentError::RecoveryParse { .. }) if !safe => {
            warn!("ignoring unreadable checkpoint record: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Pick the agent directory to recover. There is normally at most one; if
/// older ids linger (e.g. GC has not caught up), the most recently modified
/// one wins.
fn find_agent_id(agents_dir: &Path) -> AgentResult<Option<AgentId>> {
    let mut entries: Vec<(std::time::SystemTime, String)> = vec![];
    for name in list_dir(agents_dir)? {
        let modified = agents_dir
            .join(&name)
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        entries.push((modified, name));
    }
    entries.sort();
    if entries.len() > 1 {
        warn!(
            "found {} agent directories under '{}'; recovering the most recent",
            entries.len(),
            agents_dir.display()
        );
    }
    Ok(entries.pop().map(|(_, name)| AgentId::new(name)))
}

fn recover_framework(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    safe: bool,
) -> AgentResult<RecoveredFramework> {
    let info = read_record(&paths::framework_info_path(root, agent_id, framework_id), safe)?;
    let pid = read_record(&paths::framework_pid_path(root, agent_id, framework_id), safe)?;
    let mut executors = HashMap::new();
    for executor_id in list_dir(&paths::executors_dir(root, agent_id, framework_id))? {
        let executor_id = ExecutorId::new(executor_id);
        let executor = recover_executor(root, agent_id, framework_id, &executor_id, safe)?;
        executors.insert(executor_id, executor);
    }
    Ok(RecoveredFramework {
        id: framework_id.clone(),
        info,
        pid,
        executors,
    })
}

fn recover_executor(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    safe: bool,
) -> AgentResult<RecoveredExecutor> {
    let info = read_record(
        &paths::executor_info_path(root, agent_id, framework_id, executor_id),
        safe,
    )?;
    let latest = paths::read_latest_run(root, agent_id, framework_id, executor_id)?;
    let runs_dir = paths::runs_dir(root, agent_id, framework_id, executor_id);
    let mut runs = HashMap::new();
    for name in list_dir(&runs_dir)? {
        if name == paths::LATEST_SYMLINK {
            continue;
        }
        let Some(run_uuid) = RunUuid::parse(&name) else {
            return Err(AgentError::RecoveryParse {
                path: runs_dir.join(&name),
                message: format!("invalid run uuid '{name}'"),
            });
        };
        let run = recover_run(root, agent_id, framework_id, executor_id, run_uuid, safe)?;
        runs.insert(run_uuid, run);
    }
    Ok(RecoveredExecutor {
        id: executor_id.clone(),
        info,
        latest,
        runs,
    })
}

fn recover_run(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: RunUuid,
    safe: bool,
) -> AgentResult<RecoveredRun> {
    let libprocess_pid = read_record(
        &paths::libprocess_pid_path(root, agent_id, framework_id, executor_id, &run_uuid),
        safe,
    )?;
    let forked_pid = read_record(
        &paths::forked_pid_path(root, agent_id, framework_id, executor_id, &run_uuid),
        safe,
    )?;
    let mut tasks = HashMap::new();
    for task_id in list_dir(&paths::tasks_dir(
        root,
        agent_id,
        framework_id,
        executor_id,
        &run_uuid,
    ))? {
        let task_id = TaskId::new(task_id);
        let task = recover_task(
            root,
            agent_id,
            framework_id,
            executor_id,
            &run_uuid,
            &task_id,
            safe,
        )?;
        tasks.insert(task_id, task);
    }
    Ok(RecoveredRun {
        run_uuid,
        libprocess_pid,
        forked_pid,
        tasks,
    })
}

fn recover_task(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
    task_id: &TaskId,
    safe: bool,
) -> AgentResult<RecoveredTask> {
    let info = read_record(
        &paths::task_info_path(root, agent_id, framework_id, executor_id, run_uuid, task_id),
        safe,
    )?;
    let log = store::read_update_log(&paths::task_updates_path(
        root,
        agent_id,
        framework_id,
        executor_id,
        run_uuid,
        task_id,
    ))?;
    let mut updates = vec![];
    let mut acks = HashSet::new();
    for record in log {
        match record {
            UpdateLogRecord::Update(update) => updates.push(update),
            UpdateLogRecord::Ack { uuid } => {
                acks.insert(uuid);
            }
        }
    }
    Ok(RecoveredTask {
        id: task_id.clone(),
        info,
        updates,
        acks,
    })
}

fn list_dir(path: &Path) -> AgentResult<Vec<String>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(AgentError::RecoveryParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    let mut names = vec![];
    for entry in entries {
        let entry = entry.map_err(|e| AgentError::RecoveryParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;
    use crate::message::{CommandInfo, StatusSource, TaskState};
    use crate::resources::Resources;

    fn agent_info(agent_id: &AgentId) -> AgentInfo {
        AgentInfo {
            id: Some(agent_id.clone()),
            hostname: "node-1".to_string(),
            webui_hostname: "node-1".to_string(),
            resources: Resources::agent_defaults(),
            attributes: BTreeMap::new(),
            checkpoint_enabled: true,
        }
    }

    #[test]
    fn test_recover_absent_root() {
        let temp = TempDir::new().unwrap();
        let out = recover(&temp.path().join("meta"), true).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_recover_full_tree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let agent_id = AgentId::new("a1");
        let framework_id = FrameworkId::new("f1");
        let executor_id = ExecutorId::new("e1");
        let task_id = TaskId::new("t1");
        let run_uuid = RunUuid::random();

        store::checkpoint(&paths::agent_info_path(root, &agent_id), &agent_info(&agent_id))
            .unwrap();
        let framework_info = FrameworkInfo {
            framework_id: Some(framework_id.clone()),
            user: "alice".to_string(),
            name: "batch".to_string(),
            checkpoint_enabled: true,
            failover_timeout: None,
        };
        store::checkpoint(
            &paths::framework_info_path(root, &agent_id, &framework_id),
            &framework_info,
        )
        .unwrap();
        store::checkpoint(
            &paths::framework_pid_path(root, &agent_id, &framework_id),
            &"scheduler@10.0.0.2:5050".to_string(),
        )
        .unwrap();
        let executor_info = ExecutorInfo {
            executor_id: executor_id.clone(),
            framework_id: Some(framework_id.clone()),
            name: None,
            command: CommandInfo::shell("run"),
            resources: Resources::default(),
            source: None,
        };
        store::checkpoint(
            &paths::executor_info_path(root, &agent_id, &framework_id, &executor_id),
            &executor_info,
        )
        .unwrap();
        paths::create_executor_directory(root, &agent_id, &framework_id, &executor_id, &run_uuid)
            .unwrap();
        store::checkpoint(
            &paths::libprocess_pid_path(root, &agent_id, &framework_id, &executor_id, &run_uuid),
            &"executor@10.0.0.3:40000".to_string(),
        )
        .unwrap();
        let task = Task {
            task_id: task_id.clone(),
            name: "task".to_string(),
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            state: TaskState::Staging,
            resources: Resources::default(),
            statuses: vec![],
            command_task: false,
            info: None,
        };
        store::checkpoint(
            &paths::task_info_path(
                root,
                &agent_id,
                &framework_id,
                &executor_id,
                &run_uuid,
                &task_id,
            ),
            &task,
        )
        .unwrap();
        let update = StatusUpdate::new(
            framework_id.clone(),
            Some(agent_id.clone()),
            task_id.clone(),
            TaskState::Running,
            StatusSource::Executor,
            None,
            None,
            Some(executor_id.clone()),
        );
        let updates_path = paths::task_updates_path(
            root,
            &agent_id,
            &framework_id,
            &executor_id,
            &run_uuid,
            &task_id,
        );
        store::append_update(&updates_path, &UpdateLogRecord::Update(update.clone())).unwrap();
        store::append_update(&updates_path, &UpdateLogRecord::Ack { uuid: update.uuid }).unwrap();

        let state = recover(root, true).unwrap().unwrap();
        assert_eq!(state.agent_id, Some(agent_id.clone()));
        assert_eq!(state.info, Some(agent_info(&agent_id)));
        let framework = state.frameworks.get(&framework_id).unwrap();
        assert_eq!(framework.info, Some(framework_info));
        assert_eq!(framework.pid.as_deref(), Some("scheduler@10.0.0.2:5050"));
        let executor = framework.executors.get(&executor_id).unwrap();
        assert_eq!(executor.info, Some(executor_info));
        assert_eq!(executor.latest, Some(run_uuid));
        let run = executor.latest_run().unwrap();
        assert_eq!(run.libprocess_pid.as_deref(), Some("executor@10.0.0.3:40000"));
        let recovered_task = run.tasks.get(&task_id).unwrap();
        assert_eq!(recovered_task.info, Some(task));
        assert_eq!(recovered_task.updates, vec![update.clone()]);
        assert!(recovered_task.acks.contains(&update.uuid));
    }

    #[test]
    fn test_unsafe_recovery_tolerates_corrupt_records() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let agent_id = AgentId::new("a1");
        let path = paths::agent_info_path(root, &agent_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            recover(root, true),
            Err(AgentError::RecoveryParse { .. })
        ));
        let state = recover(root, false).unwrap().unwrap();
        assert!(state.info.is_none());
        assert_eq!(state.agent_id, Some(agent_id));
    }

    #[test]
    fn test_recover_empty_layout_has_no_info() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(paths::agents_dir(root)).unwrap();
        let state = recover(root, true).unwrap().unwrap();
        assert!(state.info.is_none());
        assert!(state.frameworks.is_empty());
    }
}
