use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_server::retry::{Backoff, RetryStrategy};
use log::{info, warn};

use crate::checkpoint::store::UpdateLogRecord;
use crate::checkpoint::{paths, store, AgentState};
use crate::error::{AgentError, AgentResult};
use crate::id::{FrameworkId, TaskId, UpdateUuid};
use crate::message::StatusUpdate;

/// A durable append the caller must run on the blocking pool.
/// Completion is reported back through [`UpdateManager::append_complete`].
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub path: PathBuf,
    pub record: UpdateLogRecord,
}

impl WriteJob {
    pub fn run(&self) -> AgentResult<()> {
        store::append_update(&self.path, &self.record)
    }

    pub fn kind(&self) -> AppendKind {
        match &self.record {
            UpdateLogRecord::Update(update) => AppendKind::Update(update.uuid),
            UpdateLogRecord::Ack { uuid } => AppendKind::Ack(*uuid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendKind {
    Update(UpdateUuid),
    Ack(UpdateUuid),
}

/// What the caller must do after attaching an update to a stream.
#[derive(Debug, Default)]
pub struct UpdateAttach {
    /// A durable append to start, if none was in flight for the stream.
    pub write: Option<WriteJob>,
    /// The head update to forward to the coordinator (arm a retry as well).
    pub forward: Option<StatusUpdate>,
    /// Whether the update is already durable (or needs no durability) and
    /// the executor can be acknowledged immediately.
    pub ready: bool,
}

#[derive(Debug, Default)]
pub struct AppendDone {
    pub write: Option<WriteJob>,
    pub forward: Option<StatusUpdate>,
    /// The update that just became durable; the executor that sent it can
    /// now be acknowledged.
    pub ack_executor: Option<UpdateUuid>,
}

#[derive(Debug, Default)]
pub struct AckOutcome {
    pub write: Option<WriteJob>,
    /// The next pending update to forward after the head was consumed.
    pub forward: Option<StatusUpdate>,
    /// Whether the stream drained completely and was dropped.
    pub stream_removed: bool,
}

#[derive(Debug)]
struct PendingUpdate {
    update: StatusUpdate,
    durable: bool,
}

/// One FIFO stream of status updates for a (framework, task) pair.
#[derive(Debug)]
struct UpdateStream {
    /// The per-task updates log, when the framework is checkpointed.
    path: Option<PathBuf>,
    /// Updates not yet acknowledged by the coordinator; the head is the one
    /// in flight.
    pending: VecDeque<PendingUpdate>,
    /// Records waiting for their durable append to start. Only one append
    /// per stream is in flight at a time so the log stays ordered.
    unappended: VecDeque<UpdateLogRecord>,
    appending: bool,
    /// Whether the head has been handed out for sending.
    sending: bool,
    /// The retry delay state for the head, rewound on acknowledgement.
    backoff: Backoff,
}

impl UpdateStream {
    fn new(backoff: Backoff) -> Self {
        Self {
            path: None,
            pending: VecDeque::new(),
            unappended: VecDeque::new(),
            appending: false,
            sending: false,
            backoff,
        }
    }

    fn next_write(&mut self) -> Option<WriteJob> {
        if self.appending {
            return None;
        }
        let record = self.unappended.pop_front()?;
        let path = self.path.clone()?;
        self.appending = true;
        Some(WriteJob { path, record })
    }

    /// Hand out the head for sending if it is durable and idle.
    fn next_forward(&mut self) -> Option<StatusUpdate> {
        if self.sending {
            return None;
        }
        let head = self.pending.front()?;
        if !head.durable {
            return None;
        }
        self.sending = true;
        Some(head.update.clone())
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.unappended.is_empty() && !self.appending
    }
}

/// Keeps one in-memory stream of pending status updates per (framework,
/// task), with durable appends, at-least-once delivery with exponential
/// backoff, and head-of-line acknowledgement matching.
#[derive(Debug)]
pub struct UpdateManager {
    streams: HashMap<(FrameworkId, TaskId), UpdateStream>,
    retry: RetryStrategy,
}

impl UpdateManager {
    pub fn new(retry: RetryStrategy) -> Self {
        Self {
            streams: HashMap::new(),
            retry,
        }
    }

    /// Attach an update to its stream, durably appending it first when
    /// `checkpoint` is set and a log path is known.
    pub fn update(
        &mut self,
        update: StatusUpdate,
        checkpoint: bool,
        path: Option<PathBuf>,
    ) -> UpdateAttach {
        let key = (update.framework_id.clone(), update.task_id().clone());
        let stream = self
            .streams
            .entry(key)
            .or_insert_with(|| UpdateStream::new(self.retry.backoff()));
        if let Some(path) = path {
            stream.path = Some(path);
        }
        let durable = !(checkpoint && stream.path.is_some());
        if !durable {
            stream
                .unappended
                .push_back(UpdateLogRecord::Update(update.clone()));
        }
        stream.pending.push_back(PendingUpdate { update, durable });
        UpdateAttach {
            write: stream.next_write(),
            forward: stream.next_forward(),
            ready: durable,
        }
    }

    /// A durable append finished; start the next one and hand out whatever
    /// became sendable.
    pub fn append_complete(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        kind: AppendKind,
    ) -> AppendDone {
        let key = (framework_id.clone(), task_id.clone());
        let Some(stream) = self.streams.get_mut(&key) else {
            // The framework was cleaned up while the append was in flight.
            return AppendDone::default();
        };
        stream.appending = false;
        let mut ack_executor = None;
        if let AppendKind::Update(uuid) = kind {
            for pending in stream.pending.iter_mut() {
                if pending.update.uuid == uuid {
                    pending.durable = true;
                    break;
                }
            }
            ack_executor = Some(uuid);
        }
        let write = stream.next_write();
        let forward = stream.next_forward();
        if stream.is_drained() {
            self.streams.remove(&key);
        }
        AppendDone {
            write,
            forward,
            ack_executor,
        }
    }

    /// Match an acknowledgement against the head of the stream.
    pub fn acknowledgement(
        &mut self,
        task_id: &TaskId,
        framework_id: &FrameworkId,
        uuid: UpdateUuid,
    ) -> AgentResult<AckOutcome> {
        let key = (framework_id.clone(), task_id.clone());
        let Some(stream) = self.streams.get_mut(&key) else {
            return Err(AgentError::AckOutOfOrder {
                task_id: task_id.to_string(),
                uuid: uuid.to_string(),
                message: "no outstanding updates".to_string(),
            });
        };
        match stream.pending.front() {
            Some(head) if head.update.uuid == uuid => {}
            Some(head) => {
                return Err(AgentError::AckOutOfOrder {
                    task_id: task_id.to_string(),
                    uuid: uuid.to_string(),
                    message: format!("expecting uuid {}", head.update.uuid),
                });
            }
            None => {
                return Err(AgentError::AckOutOfOrder {
                    task_id: task_id.to_string(),
                    uuid: uuid.to_string(),
                    message: "stream is empty".to_string(),
                });
            }
        }
        stream.pending.pop_front();
        stream.sending = false;
        stream.backoff.reset();
        if stream.path.is_some() {
            stream.unappended.push_back(UpdateLogRecord::Ack { uuid });
        }
        let write = stream.next_write();
        let forward = stream.next_forward();
        let stream_removed = stream.is_drained();
        if stream_removed {
            self.streams.remove(&key);
        }
        Ok(AckOutcome {
            write,
            forward,
            stream_removed,
        })
    }

    /// The delay to arm for the next retry of the stream head.
    pub fn retry_delay(&self, framework_id: &FrameworkId, task_id: &TaskId) -> Duration {
        self.streams
            .get(&(framework_id.clone(), task_id.clone()))
            .map(|s| s.backoff.delay())
            .unwrap_or_else(|| self.retry.backoff().delay())
    }

    /// A retry timer fired. If the head still matches, advance the backoff
    /// and return the update to resend together with the next retry delay.
    /// A stale uuid means the head was acknowledged in the meantime.
    pub fn retry_due(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        uuid: UpdateUuid,
    ) -> Option<(StatusUpdate, Duration)> {
        let stream = self
            .streams
            .get_mut(&(framework_id.clone(), task_id.clone()))?;
        let head = stream.pending.front()?;
        if head.update.uuid != uuid || !stream.sending {
            return None;
        }
        let update = head.update.clone();
        let delay = stream.backoff.advance();
        Some((update, delay))
    }

    /// Drop all streams of a framework (used on framework shutdown).
    pub fn cleanup(&mut self, framework_id: &FrameworkId) {
        self.streams.retain(|(fw, _), _| fw != framework_id);
    }

    /// The coordinator changed; resend every stream head that is durable.
    /// Returns the heads to forward (the caller arms retries).
    pub fn new_coordinator(&mut self) -> Vec<StatusUpdate> {
        let mut forwards = vec![];
        for stream in self.streams.values_mut() {
            stream.sending = false;
            if let Some(update) = stream.next_forward() {
                forwards.push(update);
            }
        }
        forwards
    }

    /// Rebuild streams from checkpointed per-task logs. Updates whose
    /// acknowledgement was also checkpointed are eliminated.
    pub fn recover(&mut self, root: &Path, state: &AgentState) {
        let Some(agent_id) = &state.agent_id else {
            return;
        };
        for (framework_id, framework) in &state.frameworks {
            for (executor_id, executor) in &framework.executors {
                let Some(run) = executor.latest_run() else {
                    continue;
                };
                for (task_id, task) in &run.tasks {
                    let mut replayed = 0usize;
                    for update in &task.updates {
                        if task.acks.contains(&update.uuid) {
                            continue;
                        }
                        let key = (framework_id.clone(), task_id.clone());
                        let stream = self
                            .streams
                            .entry(key)
                            .or_insert_with(|| UpdateStream::new(self.retry.backoff()));
                        stream.path = Some(paths::task_updates_path(
                            root,
                            agent_id,
                            framework_id,
                            executor_id,
                            &run.run_uuid,
                            task_id,
                        ));
                        stream.pending.push_back(PendingUpdate {
                            update: update.clone(),
                            durable: true,
                        });
                        replayed += 1;
                    }
                    if replayed > 0 {
                        info!(
                            "recovered {replayed} pending status updates for task {task_id} \
                             of framework {framework_id}"
                        );
                    }
                }
            }
        }
        if self.streams.is_empty() {
            info!("no pending status updates to recover");
        } else {
            warn!(
                "{} update streams have unacknowledged updates after recovery",
                self.streams.len()
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.streams.values().map(|s| s.pending.len()).sum()
    }
}
