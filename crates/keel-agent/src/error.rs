use std::path::PathBuf;

use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// A checkpoint write or atomic rename failed.
    /// This is fatal: the agent cannot guarantee recoverability any more.
    #[error("failed to checkpoint {path}: {message}")]
    CheckpointIo { path: PathBuf, message: String },
    /// A checkpointed record could not be parsed during recovery.
    #[error("failed to parse checkpointed record {path}: {message}")]
    RecoveryParse { path: PathBuf, message: String },
    #[error(
        "incompatible agent info detected\n\
         old agent info: {old}\n\
         new agent info: {new}\n\
         to properly upgrade the agent do as follows:\n\
         step 1: start the agent (old agent info) with recover=cleanup\n\
         step 2: wait until the agent kills all executors and shuts down\n\
         step 3: start the upgraded agent (new agent info)"
    )]
    IncompatibleAgentInfo { old: String, new: String },
    /// An acknowledgement did not match the head of the update stream.
    /// The update will be retried; the ack is dropped.
    #[error("unexpected acknowledgement {uuid} for task {task_id}: {message}")]
    AckOutOfOrder {
        task_id: String,
        uuid: String,
        message: String,
    },
    #[error("unknown framework {0}")]
    UnknownFramework(String),
    #[error("unknown executor {0}")]
    UnknownExecutor(String),
    #[error("executor {0} is not running")]
    ExecutorNotRunning(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("error in IO: {0}")]
    IoError(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the error must terminate the agent actor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::CheckpointIo { .. }
                | AgentError::RecoveryParse { .. }
                | AgentError::IncompatibleAgentInfo { .. }
        )
    }
}
