use std::io::Write;
use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::id::UpdateUuid;
use crate::message::StatusUpdate;

/// Atomically write one serialized record to `path`.
/// The record is written to a temporary file in the destination directory
/// and renamed into place, so readers never observe a partial record.
pub fn checkpoint<T: Serialize>(path: &Path, record: &T) -> AgentResult<()> {
    let parent = path.parent().ok_or_else(|| AgentError::CheckpointIo {
        path: path.to_path_buf(),
        message: "path has no parent directory".to_string(),
    })?;
    let io_error = |e: std::io::Error| AgentError::CheckpointIo {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    std::fs::create_dir_all(parent).map_err(io_error)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_error)?;
    serde_json::to_writer(&mut temp, record).map_err(|e| AgentError::CheckpointIo {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    temp.flush().map_err(io_error)?;
    temp.persist(path).map_err(|e| AgentError::CheckpointIo {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Read one record checkpointed with [`checkpoint`].
/// An absent file yields `None`; an unparsable file is a recovery error.
pub fn read_record<T: DeserializeOwned>(path: &Path) -> AgentResult<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AgentError::RecoveryParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    if data.is_empty() {
        warn!("ignoring empty checkpoint record at '{}'", path.display());
        return Ok(None);
    }
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| AgentError::RecoveryParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// One entry of a per-task updates log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateLogRecord {
    Update(StatusUpdate),
    Ack { uuid: UpdateUuid },
}

/// Append a delimited record to a per-task updates log.
/// Appends are not atomic; recovery tolerates one torn trailing record.
pub fn append_update(path: &Path, record: &UpdateLogRecord) -> AgentResult<()> {
    let io_error = |e: std::io::Error| AgentError::CheckpointIo {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut line = serde_json::to_vec(record).map_err(|e| AgentError::CheckpointIo {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    file.write_all(&line).map_err(io_error)?;
    Ok(())
}

/// Read back a per-task updates log.
/// A torn record at the end of the log (crash mid-append) is dropped with a
/// warning; corruption anywhere else aborts recovery.
pub fn read_update_log(path: &Path) -> AgentResult<Vec<UpdateLogRecord>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(AgentError::RecoveryParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    let lines = data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>();
    let mut records = vec![];
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if index == lines.len() - 1 => {
                warn!(
                    "dropping torn trailing record in updates log '{}': {e}",
                    path.display()
                );
                break;
            }
            Err(e) => {
                return Err(AgentError::RecoveryParse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::id::{FrameworkId, TaskId};
    use crate::message::{StatusSource, TaskState};

    fn update(state: TaskState) -> StatusUpdate {
        StatusUpdate::new(
            FrameworkId::new("f1"),
            None,
            TaskId::new("t1"),
            state,
            StatusSource::Executor,
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("record");
        let record = update(TaskState::Running);
        checkpoint(&path, &record).unwrap();
        let out: StatusUpdate = read_record(&path).unwrap().unwrap();
        assert_eq!(out, record);
    }

    #[test]
    fn test_checkpoint_overwrites_atomically() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record");
        checkpoint(&path, &update(TaskState::Running)).unwrap();
        let second = update(TaskState::Finished);
        checkpoint(&path, &second).unwrap();
        let out: StatusUpdate = read_record(&path).unwrap().unwrap();
        assert_eq!(out, second);
    }

    #[test]
    fn test_read_record_absent() {
        let temp = TempDir::new().unwrap();
        let out: Option<StatusUpdate> = read_record(&temp.path().join("missing")).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_read_record_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record");
        std::fs::write(&path, b"{not json").unwrap();
        let out: AgentResult<Option<StatusUpdate>> = read_record(&path);
        assert!(matches!(out, Err(AgentError::RecoveryParse { .. })));
    }

    #[test]
    fn test_update_log_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updates");
        let first = update(TaskState::Running);
        let second = update(TaskState::Finished);
        append_update(&path, &UpdateLogRecord::Update(first.clone())).unwrap();
        append_update(&path, &UpdateLogRecord::Ack { uuid: first.uuid }).unwrap();
        append_update(&path, &UpdateLogRecord::Update(second.clone())).unwrap();
        let records = read_update_log(&path).unwrap();
        assert_eq!(
            records,
            vec![
                UpdateLogRecord::Update(first.clone()),
                UpdateLogRecord::Ack { uuid: first.uuid },
                UpdateLogRecord::Update(second),
            ]
        );
    }

    #[test]
    fn test_update_log_tolerates_torn_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updates");
        let first = update(TaskState::Running);
        append_update(&path, &UpdateLogRecord::Update(first.clone())).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(b"{\"Update\":{\"framework_id");
        std::fs::write(&path, data).unwrap();
        let records = read_update_log(&path).unwrap();
        assert_eq!(records, vec![UpdateLogRecord::Update(first)]);
    }

    #[test]
    fn test_update_log_corrupt_middle_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updates");
        std::fs::write(&path, b"garbage\n").unwrap();
        append_update(
            &path,
            &UpdateLogRecord::Update(update(TaskState::Running)),
        )
        .unwrap();
        assert!(matches!(
            read_update_log(&path),
            Err(AgentError::RecoveryParse { .. })
        ));
    }
}
