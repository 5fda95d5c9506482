//! The hierarchical checkpoint layout:
//! `<root>/slaves/<agent_id>/frameworks/<framework_id>/executors/<executor_id>/runs/<run_uuid>/`
//! where `<root>` is `<work_dir>/meta` for checkpoints and `<work_dir>` for
//! executor work directories. Each executor keeps a `latest` symlink next to
//! its runs pointing at the most recent one.

use std::path::{Path, PathBuf};

use crate::error::{AgentError, AgentResult};
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid, TaskId};

pub const AGENT_INFO_FILE: &str = "slave.info";
pub const FRAMEWORK_INFO_FILE: &str = "framework.info";
pub const FRAMEWORK_PID_FILE: &str = "framework.pid";
pub const EXECUTOR_INFO_FILE: &str = "executor.info";
pub const LIBPROCESS_PID_FILE: &str = "libprocess.pid";
pub const FORKED_PID_FILE: &str = "forked.pid";
pub const TASK_INFO_FILE: &str = "task.info";
pub const TASK_UPDATES_FILE: &str = "updates";
pub const LATEST_SYMLINK: &str = "latest";

pub fn meta_root_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("meta")
}

pub fn archive_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("archive")
}

pub fn agents_dir(root: &Path) -> PathBuf {
    root.join("slaves")
}

pub fn agent_dir(root: &Path, agent_id: &AgentId) -> PathBuf {
    agents_dir(root).join(agent_id.as_str())
}

pub fn agent_info_path(root: &Path, agent_id: &AgentId) -> PathBuf {
    agent_dir(root, agent_id).join(AGENT_INFO_FILE)
}

pub fn frameworks_dir(root: &Path, agent_id: &AgentId) -> PathBuf {
    agent_dir(root, agent_id).join("frameworks")
}

pub fn framework_dir(root: &Path, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
    frameworks_dir(root, agent_id).join(framework_id.as_str())
}

pub fn framework_info_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(root, agent_id, framework_id).join(FRAMEWORK_INFO_FILE)
}

pub fn framework_pid_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(root, agent_id, framework_id).join(FRAMEWORK_PID_FILE)
}

pub fn executors_dir(root: &Path, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
    framework_dir(root, agent_id, framework_id).join("executors")
}

pub fn executor_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executors_dir(root, agent_id, framework_id).join(executor_id.as_str())
}

pub fn executor_info_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executor_dir(root, agent_id, framework_id, executor_id).join(EXECUTOR_INFO_FILE)
}

pub fn runs_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executor_dir(root, agent_id, framework_id, executor_id).join("runs")
}

pub fn run_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
) -> PathBuf {
    runs_dir(root, agent_id, framework_id, executor_id).join(run_uuid.to_string())
}

pub fn latest_run_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    runs_dir(root, agent_id, framework_id, executor_id).join(LATEST_SYMLINK)
}

pub fn libprocess_pid_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
) -> PathBuf {
    run_dir(root, agent_id, framework_id, executor_id, run_uuid).join(LIBPROCESS_PID_FILE)
}

pub fn forked_pid_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
) -> PathBuf {
    run_dir(root, agent_id, framework_id, executor_id, run_uuid).join(FORKED_PID_FILE)
}

pub fn tasks_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
) -> PathBuf {
    run_dir(root, agent_id, framework_id, executor_id, run_uuid).join("tasks")
}

pub fn task_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
    task_id: &TaskId,
) -> PathBuf {
    tasks_dir(root, agent_id, framework_id, executor_id, run_uuid).join(task_id.as_str())
}

pub fn task_info_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
    task_id: &TaskId,
) -> PathBuf {
    task_dir(root, agent_id, framework_id, executor_id, run_uuid, task_id).join(TASK_INFO_FILE)
}

pub fn task_updates_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
    task_id: &TaskId,
) -> PathBuf {
    task_dir(root, agent_id, framework_id, executor_id, run_uuid, task_id).join(TASK_UPDATES_FILE)
}

/// Create an executor run directory under `root` and point the `latest`
/// symlink at it.
pub fn create_executor_directory(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_uuid: &RunUuid,
) -> AgentResult<PathBuf> {
    let dir = run_dir(root, agent_id, framework_id, executor_id, run_uuid);
    std::fs::create_dir_all(&dir).map_err(|e| AgentError::CheckpointIo {
        path: dir.clone(),
        message: e.to_string(),
    })?;
    let latest = latest_run_path(root, agent_id, framework_id, executor_id);
    if latest.symlink_metadata().is_ok() {
        std::fs::remove_file(&latest).map_err(|e| AgentError::CheckpointIo {
            path: latest.clone(),
            message: e.to_string(),
        })?;
    }
    std::os::unix::fs::symlink(run_uuid.to_string(), &latest).map_err(|e| {
        AgentError::CheckpointIo {
            path: latest.clone(),
            message: e.to_string(),
        }
    })?;
    Ok(dir)
}

/// Read which run the `latest` symlink points to.
pub fn read_latest_run(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> AgentResult<Option<RunUuid>> {
    let latest = latest_run_path(root, agent_id, framework_id, executor_id);
    let target = match std::fs::read_link(&latest) {
        Ok(target) => target,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AgentError::RecoveryParse {
                path: latest,
                message: e.to_string(),
            })
        }
    };
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match RunUuid::parse(name) {
        Some(run_uuid) => Ok(Some(run_uuid)),
        None => Err(AgentError::RecoveryParse {
            path: latest,
            message: format!("invalid run uuid '{name}'"),
        }),
    }
}
