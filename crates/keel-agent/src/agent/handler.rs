use std::path::{Path, PathBuf};

use keel_server::actor::{ActorAction, ActorContext};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::agent::state::push_bounded;
use crate::agent::{AgentActor, AgentEvent, ExecutorState, FrameworkState, RecoverMode};
use crate::checkpoint::{paths, store};
use crate::constants::{MAX_COMPLETED_FRAMEWORKS, REGISTRATION_RETRY_INTERVAL};
use crate::error::AgentError;
use crate::id::{AgentId, ExecutorId, FrameworkId, RunUuid, TaskId, UpdateUuid};
use crate::message::{
    CoordinatorHandle, ExecutorHandle, ExecutorInfo, FrameworkInfo, StatusSource, StatusUpdate,
    Task, TaskInfo, TaskState,
};
use crate::update::{AppendKind, UpdateAttach, WriteJob};

impl AgentActor {
    // ----- coordinator (re-)registration -----

    pub(super) fn handle_new_coordinator_detected(
        &mut self,
        ctx: &mut ActorContext<Self>,
        coordinator: CoordinatorHandle,
    ) -> ActorAction {
        info!("new coordinator detected at {}", coordinator.pid);
        self.coordinator = Some(coordinator);
        self.connected = false;
        // Resend every pending update head to the new coordinator.
        for update in self.updates.new_coordinator() {
            self.forward_update(ctx, update);
        }
        match self.options.recover_mode {
            RecoverMode::Reconnect => {
                if self.recovered {
                    self.start_registration(ctx);
                } else {
                    self.pending_registration = true;
                }
            }
            RecoverMode::Cleanup => {
                info!("skipping registration because the agent is started in 'cleanup' mode");
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_no_coordinator_detected(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        info!("lost coordinator(s); waiting for a new one to be elected");
        self.coordinator = None;
        self.connected = false;
        ActorAction::Continue
    }

    pub(super) fn start_registration(&mut self, ctx: &mut ActorContext<Self>) {
        if self.registering {
            return;
        }
        self.registering = true;
        ctx.send(AgentEvent::RetryRegistration);
    }

    pub(super) fn handle_retry_registration(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        if self.connected || self.coordinator.is_none() {
            self.registering = false;
            return ActorAction::Continue;
        }
        let Some(coordinator) = self.coordinator.clone() else {
            self.registering = false;
            return ActorAction::Continue;
        };
        let info = self.info.clone();
        match info.id.clone() {
            None => {
                ctx.spawn(async move {
                    if let Err(e) = coordinator.client.register_agent(&info).await {
                        warn!("failed to send agent registration: {e}");
                    }
                });
            }
            Some(agent_id) => {
                // Re-registering: tell the coordinator what is running here,
                // with queued tasks rendered in staging state.
                let (executor_infos, tasks) = self.registration_snapshot();
                ctx.spawn(async move {
                    if let Err(e) = coordinator
                        .client
                        .reregister_agent(&agent_id, &info, &executor_infos, &tasks)
                        .await
                    {
                        warn!("failed to send agent re-registration: {e}");
                    }
                });
            }
        }
        ctx.send_with_delay(AgentEvent::RetryRegistration, REGISTRATION_RETRY_INTERVAL);
        ActorAction::Continue
    }

    fn registration_snapshot(&self) -> (Vec<ExecutorInfo>, Vec<Task>) {
        let mut executor_infos = vec![];
        let mut tasks = vec![];
        for framework in self.frameworks.values() {
            for executor in framework.executors.values() {
                let mut info = executor.info.clone();
                info.framework_id = Some(framework.id.clone());
                executor_infos.push(info);
                tasks.extend(executor.launched_tasks.values().cloned());
                tasks.extend(executor.queued_tasks.values().map(|task| {
                    Task::from_task_info(task, TaskState::Staging, &executor.id, &framework.id)
                }));
            }
        }
        (executor_infos, tasks)
    }

    pub(super) fn handle_registered(
        &mut self,
        ctx: &mut ActorContext<Self>,
        agent_id: AgentId,
    ) -> ActorAction {
        info!("registered with coordinator; given agent id {agent_id}");
        self.info.id = Some(agent_id.clone());
        self.connected = true;
        self.registering = false;
        if self.options.checkpoint {
            let path = paths::agent_info_path(&self.meta_root(), &agent_id);
            Self::spawn_record_checkpoint(ctx, "agent info".to_string(), path, self.info.clone());
        }
        // Schedule all old agent directories for garbage collection.
        let agents_dir = paths::agents_dir(&self.options.work_dir);
        if let Ok(entries) = std::fs::read_dir(&agents_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && entry.file_name().to_str() != Some(agent_id.as_str()) {
                    self.schedule_gc(ctx, path);
                }
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_reregistered(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        agent_id: AgentId,
    ) -> ActorAction {
        if self.info.id.as_ref() != Some(&agent_id) {
            error!("agent re-registered but got wrong id {agent_id}");
            return ActorAction::Stop;
        }
        info!("re-registered with coordinator");
        self.connected = true;
        self.registering = false;
        ActorAction::Continue
    }

    pub(super) fn handle_ping(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        if let Some(coordinator) = self.coordinator.clone() {
            ctx.spawn(async move {
                if let Err(e) = coordinator.client.pong().await {
                    warn!("failed to send pong: {e}");
                }
            });
        }
        ActorAction::Continue
    }

    pub(super) fn handle_shutdown(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        from: Option<String>,
    ) -> ActorAction {
        if let Some(from) = &from {
            let coordinator_pid = self.coordinator.as_ref().map(|c| c.pid.as_str());
            if coordinator_pid != Some(from.as_str()) {
                warn!(
                    "ignoring shutdown message from {from} because it is not from the \
                     registered coordinator"
                );
                return ActorAction::Continue;
            }
        }
        info!("agent asked to shut down");
        self.halting = true;
        ActorAction::Stop
    }

    // ----- task placement -----

    pub(super) fn handle_run_task(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_info: FrameworkInfo,
        framework_id: FrameworkId,
        coordinator_pid: String,
        task: TaskInfo,
    ) -> ActorAction {
        info!(
            "got assigned task {} for framework {framework_id}",
            task.task_id
        );

        if framework_info.checkpoint_enabled && !self.options.checkpoint {
            warn!(
                "asked to checkpoint framework {framework_id} but checkpointing is \
                 disabled on this agent"
            );
            self.synthesize_update(
                ctx,
                framework_id,
                task.task_id,
                TaskState::Lost,
                Some(
                    "Could not launch the task because the framework expects checkpointing, \
                     but checkpointing is disabled on the agent"
                        .to_string(),
                ),
                Some("checkpointing disabled".to_string()),
                None,
            );
            return ActorAction::Continue;
        }

        let Some(agent_id) = self.info.id.clone() else {
            warn!("dropping task {} because the agent is not registered", task.task_id);
            self.synthesize_update(
                ctx,
                framework_id,
                task.task_id,
                TaskState::Lost,
                Some("Agent has not yet registered with the coordinator".to_string()),
                None,
                None,
            );
            return ActorAction::Continue;
        };

        // Look up or create the framework.
        if !self.frameworks.contains_key(&framework_id) {
            let framework = crate::agent::Framework::new(
                framework_id.clone(),
                framework_info.clone(),
                coordinator_pid.clone(),
            );
            if framework.info.checkpoint_enabled {
                let meta_root = self.meta_root();
                Self::spawn_record_checkpoint(
                    ctx,
                    format!("info of framework {framework_id}"),
                    paths::framework_info_path(&meta_root, &agent_id, &framework_id),
                    framework.info.clone(),
                );
                Self::spawn_record_checkpoint(
                    ctx,
                    format!("pid of framework {framework_id}"),
                    paths::framework_pid_path(&meta_root, &agent_id, &framework_id),
                    framework.pid.clone(),
                );
            }
            self.frameworks.insert(framework_id.clone(), framework);
        }

        let framework_state = self
            .frameworks
            .get(&framework_id)
            .map(|f| f.state)
            .unwrap_or(FrameworkState::Terminating);
        match framework_state {
            FrameworkState::Initializing => {
                info!(
                    "enqueuing task {} until framework {framework_id} is initialized",
                    task.task_id
                );
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework.pending.push(task);
                }
                return ActorAction::Continue;
            }
            FrameworkState::Terminating => {
                warn!(
                    "asked to run task {} for framework {framework_id} which is terminating",
                    task.task_id
                );
                self.synthesize_update(
                    ctx,
                    framework_id,
                    task.task_id,
                    TaskState::Lost,
                    Some("Framework terminating".to_string()),
                    None,
                    None,
                );
                return ActorAction::Continue;
            }
            FrameworkState::Running => {}
        }

        let command_task = task.is_command_task();
        let (executor_info, executor_exists) = {
            let Some(framework) = self.frameworks.get(&framework_id) else {
                return ActorAction::Continue;
            };
            let executor_info = framework.get_executor_info(&self.options.launcher_dir, &task);
            let exists = framework.get_executor(&executor_info.executor_id).is_some();
            (executor_info, exists)
        };
        let executor_id = executor_info.executor_id.clone();

        if !executor_exists {
            let (run_uuid, directory, framework_info, resources, checkpointed) = {
                let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                    return ActorAction::Continue;
                };
                let run_uuid = match framework.create_executor(
                    &agent_id,
                    &self.options.work_dir,
                    executor_info.clone(),
                    command_task,
                ) {
                    Ok(run_uuid) => run_uuid,
                    Err(e) => {
                        error!("failed to create executor directory: {e}");
                        return ActorAction::Stop;
                    }
                };
                let executor = match framework.get_executor(&executor_id) {
                    Some(executor) => executor,
                    None => return ActorAction::Continue,
                };
                (
                    run_uuid,
                    executor.directory.clone(),
                    framework.info.clone(),
                    executor.resources.clone(),
                    framework.info.checkpoint_enabled,
                )
            };

            self.options.files.attach(&directory, &directory);

            if checkpointed {
                // Create the meta run directory (including the `latest`
                // symlink) and checkpoint the executor info.
                let meta_root = self.meta_root();
                let info = executor_info.clone();
                let (meta_agent_id, meta_framework_id, meta_executor_id) =
                    (agent_id.clone(), framework_id.clone(), executor_id.clone());
                Self::spawn_checkpoint_job(
                    ctx,
                    format!("info of executor '{executor_id}'"),
                    move || {
                        paths::create_executor_directory(
                            &meta_root,
                            &meta_agent_id,
                            &meta_framework_id,
                            &meta_executor_id,
                            &run_uuid,
                        )?;
                        store::checkpoint(
                            &paths::executor_info_path(
                                &meta_root,
                                &meta_agent_id,
                                &meta_framework_id,
                                &meta_executor_id,
                            ),
                            &info,
                        )
                    },
                );
            }

            let isolation = self.options.isolation.clone();
            let launch_agent_id = agent_id.clone();
            let launch_framework_id = framework_id.clone();
            let launch_info = executor_info.clone();
            ctx.spawn(async move {
                if let Err(e) = isolation
                    .launch_executor(
                        &launch_agent_id,
                        &launch_framework_id,
                        &framework_info,
                        &launch_info,
                        &run_uuid,
                        &directory,
                        &resources,
                    )
                    .await
                {
                    warn!("failed to launch executor: {e}");
                }
            });

            // Make sure the executor registers within the given timeout.
            ctx.send_with_delay(
                AgentEvent::RegisterExecutorTimeout {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    run_uuid,
                },
                self.options.executor_registration_timeout,
            );
        }

        let (executor_state, run_uuid, checkpoint_enabled) = {
            let Some(framework) = self.frameworks.get(&framework_id) else {
                return ActorAction::Continue;
            };
            let Some(executor) = framework.get_executor(&executor_id) else {
                return ActorAction::Continue;
            };
            (executor.state, executor.run_uuid, executor.checkpoint_enabled)
        };

        if matches!(
            executor_state,
            ExecutorState::Terminating | ExecutorState::Terminated
        ) {
            warn!(
                "asked to run task {} with executor '{executor_id}' which is \
                 terminating/terminated",
                task.task_id
            );
            self.synthesize_update(
                ctx,
                framework_id,
                task.task_id,
                TaskState::Lost,
                Some("Executor terminating/terminated".to_string()),
                None,
                Some(executor_id),
            );
            return ActorAction::Continue;
        }

        // Checkpoint the task before anything else; a no-op for frameworks
        // without checkpointing.
        if checkpoint_enabled {
            let record = Task::from_task_info(
                &task,
                TaskState::Staging,
                &executor_id,
                &framework_id,
            );
            let path = paths::task_info_path(
                &self.meta_root(),
                &agent_id,
                &framework_id,
                &executor_id,
                &run_uuid,
                &task.task_id,
            );
            Self::spawn_record_checkpoint(
                ctx,
                format!("info of task {}", task.task_id),
                path,
                record,
            );
        }

        self.options.metrics.record_task_state(TaskState::Staging);

        let task_id = task.task_id.clone();
        let dispatch = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                return ActorAction::Continue;
            };
            let framework_info = framework.info.clone();
            let framework_pid = framework.pid.clone();
            let Some(executor) = framework.get_executor_mut(&executor_id) else {
                return ActorAction::Continue;
            };
            if executor.state == ExecutorState::Registering {
                info!(
                    "queuing task {} for executor '{executor_id}' of framework \
                     {framework_id}",
                    task.task_id
                );
                executor.queued_tasks.insert(task.task_id.clone(), task.clone());
                None
            } else {
                // The executor is running: account the task and send it over.
                executor.add_task(&task);
                Some((
                    executor.resources.clone(),
                    executor.pid.clone(),
                    framework_info,
                    framework_pid,
                ))
            }
        };
        if let Some((resources, pid, framework_info, framework_pid)) = dispatch {
            self.dispatch_resources_changed(
                ctx,
                framework_id.clone(),
                executor_id,
                resources,
            );
            if let Some(pid) = pid {
                info!("sending task {} to executor at {}", task_id, pid.pid);
                ctx.spawn(async move {
                    if let Err(e) = pid
                        .client
                        .run_task(&framework_info, &framework_id, &framework_pid, &task)
                        .await
                    {
                        warn!("failed to send task to executor: {e}");
                    }
                });
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_kill_task(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
    ) -> ActorAction {
        info!("asked to kill task {task_id} of framework {framework_id}");
        let Some(framework) = self.frameworks.get(&framework_id) else {
            warn!(
                "cannot kill task {task_id} of framework {framework_id} because no such \
                 framework is running"
            );
            self.synthesize_update(
                ctx,
                framework_id,
                task_id,
                TaskState::Lost,
                Some("Cannot find framework".to_string()),
                None,
                None,
            );
            return ActorAction::Continue;
        };
        let Some(executor) = framework.get_executor_by_task(&task_id) else {
            warn!(
                "cannot kill task {task_id} of framework {framework_id} because no \
                 corresponding executor is running"
            );
            self.synthesize_update(
                ctx,
                framework_id,
                task_id,
                TaskState::Lost,
                Some("Cannot find executor".to_string()),
                None,
                None,
            );
            return ActorAction::Continue;
        };
        if executor.state == ExecutorState::Registering {
            // The executor has not come up yet; the queued task is removed
            // through the terminal update.
            let executor_id = executor.id.clone();
            self.synthesize_update(
                ctx,
                framework_id,
                task_id,
                TaskState::Killed,
                Some("Unregistered executor".to_string()),
                None,
                Some(executor_id),
            );
        } else if let Some(pid) = executor.pid.clone() {
            ctx.spawn(async move {
                if let Err(e) = pid.client.kill_task(&framework_id, &task_id).await {
                    warn!("failed to send kill to executor: {e}");
                }
            });
        }
        ActorAction::Continue
    }

    // ----- executor lifecycle -----

    pub(super) fn handle_register_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        sender: ExecutorHandle,
    ) -> ActorAction {
        info!(
            "got registration for executor '{executor_id}' of framework {framework_id}"
        );
        let known = self
            .frameworks
            .get(&framework_id)
            .and_then(|f| f.get_executor(&executor_id))
            .map(|e| e.state);
        match known {
            None => {
                warn!(
                    "unexpected executor '{executor_id}' registering for framework \
                     {framework_id}; telling it to exit"
                );
                Self::spawn_shutdown_executor_message(ctx, sender);
                return ActorAction::Continue;
            }
            Some(state) if state != ExecutorState::Registering => {
                warn!(
                    "executor '{executor_id}' of framework {framework_id} is not expected \
                     to be registering; telling it to exit"
                );
                Self::spawn_shutdown_executor_message(ctx, sender);
                return ActorAction::Continue;
            }
            Some(_) => {}
        }

        let agent_id = self.info.id.clone();
        let agent_info = self.info.clone();
        let meta_root = self.meta_root();
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return ActorAction::Continue;
        };
        let framework_info = framework.info.clone();
        let framework_pid = framework.pid.clone();
        let checkpointed = framework.info.checkpoint_enabled;
        let Some(executor) = framework.get_executor_mut(&executor_id) else {
            return ActorAction::Continue;
        };

        executor.pid = Some(sender.clone());
        executor.state = ExecutorState::Running;

        if checkpointed {
            if let Some(agent_id) = &agent_id {
                let path = paths::libprocess_pid_path(
                    &meta_root,
                    agent_id,
                    &framework_id,
                    &executor_id,
                    &executor.run_uuid,
                );
                Self::spawn_record_checkpoint(
                    ctx,
                    format!("libprocess pid of executor '{executor_id}'"),
                    path,
                    sender.pid.clone(),
                );
            }
        }

        // Account for the queued tasks before flushing them.
        let queued = executor.queued_tasks.drain().collect::<Vec<_>>();
        for (_, task) in &queued {
            executor.add_task(task);
        }
        let resources = executor.resources.clone();
        let executor_info = executor.info.clone();
        self.dispatch_resources_changed(
            ctx,
            framework_id.clone(),
            executor_id.clone(),
            resources,
        );

        // Tell the executor it is registered and flush the queued tasks,
        // in that order, on one task so the messages stay sequenced.
        ctx.spawn(async move {
            let agent_id = agent_id.unwrap_or_else(|| AgentId::new(""));
            if let Err(e) = sender
                .client
                .executor_registered(
                    &executor_info,
                    &framework_id,
                    &framework_info,
                    &agent_id,
                    &agent_info,
                )
                .await
            {
                warn!("failed to send executor registration reply: {e}");
                return;
            }
            for (_, task) in queued {
                if let Err(e) = sender
                    .client
                    .run_task(&framework_info, &framework_id, &framework_pid, &task)
                    .await
                {
                    warn!("failed to flush queued task {}: {e}", task.task_id);
                }
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_reregister_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<TaskInfo>,
        updates: Vec<StatusUpdate>,
        sender: ExecutorHandle,
    ) -> ActorAction {
        info!(
            "re-registering executor '{executor_id}' of framework {framework_id}"
        );
        let agent_id = self.info.id.clone().unwrap_or_else(|| AgentId::new(""));
        let agent_info = self.info.clone();
        let replay = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                warn!(
                    "unknown framework {framework_id} for re-registering executor \
                     '{executor_id}'; telling it to exit"
                );
                Self::spawn_shutdown_executor_message(ctx, sender);
                return ActorAction::Continue;
            };
            let framework_info = framework.info.clone();
            let framework_pid = framework.pid.clone();
            let Some(executor) = framework.get_executor_mut(&executor_id) else {
                warn!(
                    "unknown executor '{executor_id}' re-registering for framework \
                     {framework_id}; telling it to exit"
                );
                Self::spawn_shutdown_executor_message(ctx, sender);
                return ActorAction::Continue;
            };

            executor.pid = Some(sender.clone());
            executor.recovered_pid = None;
            executor.state = ExecutorState::Running;

            // Updates the manager already checkpointed are dropped; the
            // executor will receive their acknowledgements in due course.
            let replay = updates
                .into_iter()
                .filter(|u| !executor.contains_update(u.task_id(), &u.uuid))
                .collect::<Vec<_>>();

            // Any task still staging locally but absent from the executor's
            // own list never reached it: relaunch.
            let known = tasks
                .iter()
                .map(|t| t.task_id.clone())
                .collect::<std::collections::HashSet<_>>();
            let mut resend = vec![];
            for task in executor.launched_tasks.values() {
                if task.state == TaskState::Staging && !known.contains(&task.task_id) {
                    match executor.staged.get(&task.task_id) {
                        Some(info) => resend.push(info.clone()),
                        None => warn!(
                            "cannot relaunch staging task {} because its description \
                             was not recovered",
                            task.task_id
                        ),
                    }
                }
            }

            let reply_sender = sender.clone();
            ctx.spawn(async move {
                if let Err(e) = reply_sender
                    .client
                    .executor_reregistered(&agent_id, &agent_info)
                    .await
                {
                    warn!("failed to send executor re-registration reply: {e}");
                    return;
                }
                for task in resend {
                    info!("relaunching staged task {}", task.task_id);
                    if let Err(e) = reply_sender
                        .client
                        .run_task(&framework_info, &framework_id, &framework_pid, &task)
                        .await
                    {
                        warn!("failed to relaunch task {}: {e}", task.task_id);
                    }
                }
            });
            replay
        };
        for update in replay {
            self.status_update(ctx, update);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_register_executor_timeout(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_uuid: RunUuid,
    ) -> ActorAction {
        let kill = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                return ActorAction::Continue;
            };
            let Some(executor) = framework.get_executor_mut(&executor_id) else {
                return ActorAction::Continue;
            };
            if executor.run_uuid != run_uuid {
                // A newer run of the same executor id is active.
                return ActorAction::Continue;
            }
            if executor.state == ExecutorState::Registering && executor.pid.is_none() {
                info!(
                    "terminating executor '{executor_id}' of framework {framework_id} \
                     because it did not register within the timeout"
                );
                executor.state = ExecutorState::Terminating;
                true
            } else {
                false
            }
        };
        if kill {
            self.dispatch_kill_executor(ctx, framework_id, executor_id);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_shutdown_executor_timeout(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_uuid: RunUuid,
    ) -> ActorAction {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            return ActorAction::Continue;
        };
        let Some(executor) = framework.get_executor(&executor_id) else {
            return ActorAction::Continue;
        };
        if executor.run_uuid != run_uuid {
            debug!(
                "ignoring shutdown timeout for old run {run_uuid} of executor \
                 '{executor_id}'"
            );
            return ActorAction::Continue;
        }
        if executor.state == ExecutorState::Terminating {
            info!(
                "killing executor '{executor_id}' of framework {framework_id} after \
                 the shutdown grace period"
            );
            self.dispatch_kill_executor(ctx, framework_id, executor_id);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_executor_started(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        forked_pid: u32,
    ) -> ActorAction {
        let agent_id = self.info.id.clone();
        let meta_root = self.meta_root();
        let interval = self.options.resource_monitoring_interval;
        let (run_uuid, info) = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                warn!(
                    "framework {framework_id} for started executor '{executor_id}' is gone"
                );
                return ActorAction::Continue;
            };
            let Some(executor) = framework.get_executor_mut(&executor_id) else {
                warn!("unknown executor '{executor_id}' of framework {framework_id} started");
                return ActorAction::Continue;
            };
            executor.forked_pid = Some(forked_pid);
            (executor.run_uuid, executor.info.clone())
        };
        let checkpointed = self
            .frameworks
            .get(&framework_id)
            .is_some_and(|f| f.info.checkpoint_enabled);
        if checkpointed {
            if let Some(agent_id) = &agent_id {
                let path = paths::forked_pid_path(
                    &meta_root,
                    agent_id,
                    &framework_id,
                    &executor_id,
                    &run_uuid,
                );
                Self::spawn_record_checkpoint(
                    ctx,
                    format!("forked pid of executor '{executor_id}'"),
                    path,
                    forked_pid,
                );
            }
        }
        self.monitor.watch(framework_id, executor_id, info, interval);
        ActorAction::Continue
    }

    pub(super) fn handle_executor_terminated(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        exit_status: i32,
        destroyed: bool,
        message: String,
    ) -> ActorAction {
        info!(
            "executor '{executor_id}' of framework {framework_id} terminated \
             with status {exit_status}"
        );
        self.monitor.unwatch(&framework_id, &executor_id);

        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!("framework {framework_id} for terminated executor '{executor_id}' is gone");
            return ActorAction::Continue;
        };
        let framework_terminating = framework.state == FrameworkState::Terminating;
        let Some(executor) = framework.get_executor_mut(&executor_id) else {
            warn!(
                "unknown executor '{executor_id}' of framework {framework_id} terminated"
            );
            return ActorAction::Continue;
        };
        executor.mark_terminated();
        let command_executor = executor.command_executor;

        // Transition live tasks. When the isolation layer destroyed the
        // executor or it is a command executor the tasks failed; otherwise
        // they are lost. No updates are synthesized for a terminating
        // framework since its streams are already torn down and no
        // acknowledgements would ever arrive.
        if !framework_terminating {
            let state = if destroyed || command_executor {
                TaskState::Failed
            } else {
                TaskState::Lost
            };
            let mut task_ids = executor
                .live_tasks()
                .iter()
                .map(|t| t.task_id.clone())
                .collect::<Vec<_>>();
            task_ids.extend(executor.queued_tasks.keys().cloned());
            for task_id in task_ids {
                self.synthesize_update(
                    ctx,
                    framework_id.clone(),
                    task_id,
                    state,
                    Some(message.clone()),
                    None,
                    Some(executor_id.clone()),
                );
            }
        }

        if !command_executor {
            if let (Some(agent_id), Some(coordinator)) =
                (self.info.id.clone(), self.coordinator.clone())
            {
                let framework_id = framework_id.clone();
                let executor_id = executor_id.clone();
                ctx.spawn(async move {
                    if let Err(e) = coordinator
                        .client
                        .exited_executor(&agent_id, &framework_id, &executor_id, exit_status)
                        .await
                    {
                        warn!("failed to report exited executor: {e}");
                    }
                });
            }
        }

        self.cleanup_executor(ctx, &framework_id, &executor_id);
        ActorAction::Continue
    }

    // ----- framework lifecycle -----

    pub(super) fn handle_shutdown_framework(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        from: Option<String>,
    ) -> ActorAction {
        if let Some(from) = &from {
            let coordinator_pid = self.coordinator.as_ref().map(|c| c.pid.as_str());
            if coordinator_pid != Some(from.as_str()) {
                warn!(
                    "ignoring shutdown framework message from {from} because it is not \
                     from the registered coordinator"
                );
                return ActorAction::Continue;
            }
        }
        info!("asked to shut down framework {framework_id}");
        if self.frameworks.contains_key(&framework_id) {
            self.shutdown_framework(ctx, &framework_id);
        }
        // Close all update streams for this framework either way.
        self.updates.cleanup(&framework_id);
        ActorAction::Continue
    }

    pub(super) fn shutdown_framework(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
    ) {
        let executor_ids = {
            let Some(framework) = self.frameworks.get_mut(framework_id) else {
                return;
            };
            framework.state = FrameworkState::Terminating;
            framework.executors.keys().cloned().collect::<Vec<_>>()
        };
        for executor_id in executor_ids {
            self.shutdown_executor(ctx, framework_id, &executor_id);
        }
        self.updates.cleanup(framework_id);
    }

    pub(super) fn shutdown_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) {
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(executor) = framework.get_executor_mut(executor_id) else {
            return;
        };
        info!(
            "shutting down executor '{executor_id}' of framework {framework_id}"
        );
        executor.state = ExecutorState::Terminating;
        if let Some(pid) = executor.pid.clone() {
            Self::spawn_shutdown_executor_message(ctx, pid);
        }
        // Prepare a kill in case the executor does not comply.
        ctx.send_with_delay(
            AgentEvent::ShutdownExecutorTimeout {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
                run_uuid: executor.run_uuid,
            },
            self.options.executor_shutdown_grace_period,
        );
    }

    pub(super) fn handle_update_framework(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        pid: String,
    ) -> ActorAction {
        let agent_id = self.info.id.clone();
        let meta_root = self.meta_root();
        if let Some(framework) = self.frameworks.get_mut(&framework_id) {
            info!("updating framework {framework_id} pid to {pid}");
            framework.pid = pid.clone();
            if framework.info.checkpoint_enabled {
                if let Some(agent_id) = &agent_id {
                    Self::spawn_record_checkpoint(
                        ctx,
                        format!("pid of framework {framework_id}"),
                        paths::framework_pid_path(&meta_root, agent_id, &framework_id),
                        pid,
                    );
                }
            }
        }
        ActorAction::Continue
    }

    // ----- framework <-> executor messaging -----

    /// A framework message could not be routed. Per the propagation policy
    /// these errors are never fatal: log, count, drop.
    fn drop_framework_message(&self, e: AgentError) {
        warn!("dropping framework message: {e}");
        self.options
            .metrics
            .invalid_framework_messages
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub(super) fn handle_framework_to_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) -> ActorAction {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            self.drop_framework_message(AgentError::UnknownFramework(framework_id.to_string()));
            return ActorAction::Continue;
        };
        let Some(executor) = framework.get_executor(&executor_id) else {
            self.drop_framework_message(AgentError::UnknownExecutor(executor_id.to_string()));
            return ActorAction::Continue;
        };
        match &executor.pid {
            Some(pid) if executor.state != ExecutorState::Registering => {
                let pid = pid.clone();
                ctx.spawn(async move {
                    if let Err(e) = pid
                        .client
                        .framework_to_executor(&agent_id, &framework_id, &executor_id, &data)
                        .await
                    {
                        warn!("failed to relay framework message: {e}");
                    }
                });
                self.options
                    .metrics
                    .valid_framework_messages
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            _ => {
                self.drop_framework_message(AgentError::ExecutorNotRunning(
                    executor_id.to_string(),
                ));
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_executor_to_framework(
        &mut self,
        ctx: &mut ActorContext<Self>,
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) -> ActorAction {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            self.drop_framework_message(AgentError::UnknownFramework(framework_id.to_string()));
            return ActorAction::Continue;
        };
        let framework_pid = framework.pid.clone();
        let Some(coordinator) = self.coordinator.clone() else {
            warn!("cannot relay executor message without a coordinator");
            self.options
                .metrics
                .invalid_framework_messages
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return ActorAction::Continue;
        };
        info!("relaying message for framework {framework_id} to {framework_pid}");
        ctx.spawn(async move {
            if let Err(e) = coordinator
                .client
                .executor_to_framework(&framework_pid, &agent_id, &framework_id, &executor_id, &data)
                .await
            {
                warn!("failed to relay executor message: {e}");
            }
        });
        self.options
            .metrics
            .valid_framework_messages
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ActorAction::Continue
    }

    // ----- status updates -----

    /// The single entry point for executor-originated and agent-synthesized
    /// status updates.
    pub(super) fn status_update(&mut self, ctx: &mut ActorContext<Self>, update: StatusUpdate) {
        info!("handling status update {update}");
        let agent_id = self.info.id.clone();
        let meta_root = self.meta_root();
        let mut checkpoint = false;
        let mut path = None;
        let mut executor_pid = None;
        let mut resources_update = None;

        match self.frameworks.get_mut(&update.framework_id) {
            Some(framework) => {
                let framework_checkpointed = framework.info.checkpoint_enabled;
                match framework.get_executor_by_task_mut(update.task_id()) {
                    Some(executor) => {
                        executor.update_task_state(update.task_id(), update.state());
                        executor.add_update(update.task_id(), update.uuid);
                        if update.state().is_terminal() {
                            executor.remove_task(update.task_id());
                            resources_update =
                                Some((executor.id.clone(), executor.resources.clone()));
                        }
                        executor_pid = executor.pid.clone();
                        checkpoint = framework_checkpointed;
                        if checkpoint {
                            if let Some(agent_id) = &agent_id {
                                path = Some(paths::task_updates_path(
                                    &meta_root,
                                    agent_id,
                                    &update.framework_id,
                                    &executor.id,
                                    &executor.run_uuid,
                                    update.task_id(),
                                ));
                            }
                        }
                    }
                    None => {
                        warn!(
                            "could not find executor for task {} of framework {}",
                            update.task_id(),
                            update.framework_id
                        );
                        self.options
                            .metrics
                            .invalid_status_updates
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
            None => {
                warn!(
                    "could not find framework {} for task {}",
                    update.framework_id,
                    update.task_id()
                );
                self.options
                    .metrics
                    .invalid_status_updates
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        if let Some((executor_id, resources)) = resources_update {
            self.dispatch_resources_changed(
                ctx,
                update.framework_id.clone(),
                executor_id,
                resources,
            );
        }

        self.options.metrics.record_task_state(update.state());
        self.options
            .metrics
            .valid_status_updates
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // Forward even when the framework or executor is unknown: the
        // coordinator keeps no persistent state and relies on updates to
        // reconcile.
        let framework_id = update.framework_id.clone();
        let task_id = update.task_id().clone();
        let uuid = update.uuid;
        let attach = self.updates.update(update, checkpoint, path);
        self.process_update_attach(ctx, &framework_id, &task_id, uuid, attach, executor_pid);
    }

    fn process_update_attach(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        uuid: UpdateUuid,
        attach: UpdateAttach,
        executor_pid: Option<ExecutorHandle>,
    ) {
        if let Some(job) = attach.write {
            Self::spawn_append(ctx, framework_id.clone(), task_id.clone(), job);
        }
        if attach.ready {
            // Durability is not required; acknowledge the executor at once.
            if let Some(pid) = executor_pid {
                self.ack_executor(ctx, framework_id.clone(), task_id.clone(), uuid, pid);
            }
        }
        if let Some(update) = attach.forward {
            self.forward_update(ctx, update);
        }
    }

    pub(super) fn handle_update_append_complete(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        kind: AppendKind,
        result: Result<(), String>,
    ) -> ActorAction {
        if let Err(e) = result {
            // Losing the updates log means losing at-least-once delivery
            // across restarts, which the agent must not pretend to have.
            error!(
                "failed to checkpoint status update for task {task_id} of framework \
                 {framework_id}: {e}"
            );
            return ActorAction::Stop;
        }
        let done = self.updates.append_complete(&framework_id, &task_id, kind);
        if let Some(job) = done.write {
            Self::spawn_append(ctx, framework_id.clone(), task_id.clone(), job);
        }
        if let Some(uuid) = done.ack_executor {
            let pid = self
                .frameworks
                .get(&framework_id)
                .and_then(|f| f.get_executor_by_task(&task_id))
                .and_then(|e| e.pid.clone());
            if let Some(pid) = pid {
                self.ack_executor(ctx, framework_id.clone(), task_id.clone(), uuid, pid);
            }
        }
        if let Some(update) = done.forward {
            self.forward_update(ctx, update);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_status_update_acknowledgement(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    ) -> ActorAction {
        info!(
            "got acknowledgement of status update for task {task_id} of framework \
             {framework_id}"
        );
        match self.updates.acknowledgement(&task_id, &framework_id, uuid) {
            Ok(outcome) => {
                if let Some(job) = outcome.write {
                    Self::spawn_append(ctx, framework_id.clone(), task_id.clone(), job);
                }
                if let Some(update) = outcome.forward {
                    self.forward_update(ctx, update);
                }
            }
            Err(e) => {
                error!("failed to handle status update acknowledgement: {e}");
                self.options
                    .metrics
                    .invalid_status_updates
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return ActorAction::Continue;
            }
        }
        let executor_id = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                warn!("status update acknowledgement for unknown framework {framework_id}");
                return ActorAction::Continue;
            };
            let Some(executor) = framework.get_executor_by_task_mut(&task_id) else {
                warn!("status update acknowledgement for task {task_id} of unknown executor");
                return ActorAction::Continue;
            };
            executor.remove_update(&task_id, &uuid);
            executor.id.clone()
        };
        self.cleanup_executor(ctx, &framework_id, &executor_id);
        ActorAction::Continue
    }

    pub(super) fn handle_status_update_retry(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    ) -> ActorAction {
        // A stale uuid means the head was acknowledged; ignore silently.
        if let Some((update, delay)) = self.updates.retry_due(&framework_id, &task_id, uuid) {
            debug!("retrying status update {update}");
            if let Some(coordinator) = self.coordinator.clone() {
                ctx.spawn(async move {
                    if let Err(e) = coordinator.client.status_update(&update).await {
                        warn!("failed to send status update: {e}");
                    }
                });
            }
            ctx.send_with_delay(
                AgentEvent::StatusUpdateRetry {
                    framework_id,
                    task_id,
                    uuid,
                },
                delay,
            );
        }
        ActorAction::Continue
    }

    fn forward_update(&mut self, ctx: &mut ActorContext<Self>, update: StatusUpdate) {
        let framework_id = update.framework_id.clone();
        let task_id = update.task_id().clone();
        let uuid = update.uuid;
        let delay = self.updates.retry_delay(&framework_id, &task_id);
        match self.coordinator.clone() {
            Some(coordinator) => {
                debug!("forwarding status update {update} to {}", coordinator.pid);
                ctx.spawn(async move {
                    if let Err(e) = coordinator.client.status_update(&update).await {
                        warn!("failed to send status update: {e}");
                    }
                });
            }
            None => {
                debug!("no coordinator known; status update {update} will be retried");
            }
        }
        ctx.send_with_delay(
            AgentEvent::StatusUpdateRetry {
                framework_id,
                task_id,
                uuid,
            },
            delay,
        );
    }

    fn ack_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
        pid: ExecutorHandle,
    ) {
        let agent_id = self.info.id.clone().unwrap_or_else(|| AgentId::new(""));
        ctx.spawn(async move {
            if let Err(e) = pid
                .client
                .status_update_acknowledgement(&agent_id, &framework_id, &task_id, &uuid)
                .await
            {
                warn!("failed to acknowledge executor: {e}");
            }
        });
    }

    /// Synthesize an agent-originated status update and run it through the
    /// standard pipeline.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn synthesize_update(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        state: TaskState,
        message: Option<String>,
        reason: Option<String>,
        executor_id: Option<ExecutorId>,
    ) {
        let update = StatusUpdate::new(
            framework_id,
            self.info.id.clone(),
            task_id,
            state,
            StatusSource::Agent,
            message,
            reason,
            executor_id,
        );
        self.status_update(ctx, update);
    }

    // ----- cleanup -----

    /// Destroy a terminated executor once nothing references it any more,
    /// then the framework once it has no executors, then the agent itself
    /// in cleanup mode.
    pub(super) fn cleanup_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) {
        let directory = {
            let Some(framework) = self.frameworks.get_mut(framework_id) else {
                return;
            };
            let framework_terminating = framework.state == FrameworkState::Terminating;
            let eligible = framework.get_executor(executor_id).is_some_and(|executor| {
                executor.state == ExecutorState::Terminated
                    && (executor.updates_empty() || framework_terminating)
            });
            if !eligible {
                None
            } else {
                let directory = framework
                    .get_executor(executor_id)
                    .map(|e| e.directory.clone());
                framework.destroy_executor(executor_id);
                directory
            }
        };
        if let Some(directory) = directory {
            self.schedule_gc(ctx, directory);
        }

        let framework_gone = self
            .frameworks
            .get(framework_id)
            .is_some_and(|f| f.executors.is_empty());
        if framework_gone {
            if let Some(framework) = self.frameworks.remove(framework_id) {
                info!("removed framework {framework_id}");
                push_bounded(
                    &mut self.completed_frameworks,
                    framework,
                    MAX_COMPLETED_FRAMEWORKS,
                );
            }
        }

        if self.options.recover_mode == RecoverMode::Cleanup && self.frameworks.is_empty() {
            self.cleanup_mode_shutdown(ctx);
        }
    }

    /// All executors are gone in cleanup mode: archive and delete the meta
    /// directory, then shut down.
    fn cleanup_mode_shutdown(&mut self, ctx: &mut ActorContext<Self>) {
        info!(
            "agent is shutting down because it was started with recover=cleanup and \
             all executors have terminated"
        );
        let meta_root = self.meta_root();
        let archive_dir = paths::archive_dir(&self.options.work_dir);
        let agent_id = self.info.id.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let out = tokio::task::spawn_blocking(move || {
                archive_meta_directory(&meta_root, &archive_dir, agent_id.as_ref())
            })
            .await;
            match out {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("failed to archive the meta directory: {e}"),
                Err(e) => error!("failed to archive the meta directory: {e}"),
            }
            let _ = handle.send(AgentEvent::Shutdown { from: None }).await;
        });
    }

    pub(super) fn handle_gc_complete(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        path: PathBuf,
    ) -> ActorAction {
        self.gc.finished(&path);
        self.options.files.detach(&path);
        ActorAction::Continue
    }

    pub(super) fn schedule_gc(&mut self, ctx: &mut ActorContext<Self>, path: PathBuf) {
        let done = self.gc.schedule(self.options.gc_delay, &path);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            // The result is already logged by the collector; all that is
            // left is detaching the path from the file service.
            let _ = done.await;
            let _ = handle.send(AgentEvent::GcComplete { path }).await;
        });
    }

    // ----- disk usage watch -----

    pub(super) fn handle_check_disk_usage(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        let work_dir = self.options.work_dir.clone();
        let capacity_mb = self.options.resources.disk;
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                sample_disk_usage(&work_dir, capacity_mb)
            })
            .await
            .unwrap_or_else(|e| Err(e.to_string()));
            let _ = handle.send(AgentEvent::DiskUsageSampled { result }).await;
        });
        ActorAction::Continue
    }

    pub(super) fn handle_disk_usage_sampled(
        &mut self,
        ctx: &mut ActorContext<Self>,
        result: Result<f64, String>,
    ) -> ActorAction {
        match result {
            Ok(usage) => {
                let gc_delay = self.options.gc_delay;
                let age = gc_delay.mul_f64((1.0 - usage).clamp(0.0, 1.0));
                info!(
                    "current disk usage {:.2}%, max allowed age {age:?}",
                    usage * 100.0
                );
                // Directories are scheduled gc_delay into the future, so
                // pruning by (gc_delay - age) deletes those older than age.
                self.gc.prune(gc_delay.saturating_sub(age));
            }
            Err(e) => {
                error!("failed to get disk usage: {e}");
            }
        }
        ctx.send_with_delay(AgentEvent::CheckDiskUsage, self.options.disk_watch_interval);
        ActorAction::Continue
    }

    pub(super) fn handle_checkpoint_written(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        description: String,
        result: Result<(), String>,
    ) -> ActorAction {
        match result {
            Ok(()) => ActorAction::Continue,
            Err(e) => {
                error!("failed to checkpoint {description}: {e}");
                ActorAction::Stop
            }
        }
    }

    // ----- spawn helpers -----

    pub(super) fn dispatch_resources_changed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        resources: crate::resources::Resources,
    ) {
        let isolation = self.options.isolation.clone();
        ctx.spawn(async move {
            if let Err(e) = isolation
                .resources_changed(&framework_id, &executor_id, &resources)
                .await
            {
                warn!("failed to update executor resources: {e}");
            }
        });
    }

    pub(super) fn dispatch_kill_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    ) {
        let isolation = self.options.isolation.clone();
        ctx.spawn(async move {
            if let Err(e) = isolation.kill_executor(&framework_id, &executor_id).await {
                warn!("failed to kill executor: {e}");
            }
        });
    }

    fn spawn_shutdown_executor_message(ctx: &mut ActorContext<Self>, pid: ExecutorHandle) {
        ctx.spawn(async move {
            if let Err(e) = pid.client.shutdown_executor().await {
                warn!("failed to send executor shutdown: {e}");
            }
        });
    }

    fn spawn_append(
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        job: WriteJob,
    ) {
        let handle = ctx.handle().clone();
        let kind = job.kind();
        ctx.spawn(async move {
            let result = tokio::task::spawn_blocking(move || job.run())
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()));
            let _ = handle
                .send(AgentEvent::UpdateAppendComplete {
                    framework_id,
                    task_id,
                    kind,
                    result,
                })
                .await;
        });
    }

    pub(super) fn spawn_record_checkpoint<T: Serialize + Send + 'static>(
        ctx: &mut ActorContext<Self>,
        description: String,
        path: PathBuf,
        record: T,
    ) {
        Self::spawn_checkpoint_job(ctx, description, move || store::checkpoint(&path, &record));
    }

    pub(super) fn spawn_checkpoint_job<F>(
        ctx: &mut ActorContext<Self>,
        description: String,
        job: F,
    ) where
        F: FnOnce() -> crate::error::AgentResult<()> + Send + 'static,
    {
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let result = tokio::task::spawn_blocking(job)
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()));
            let _ = handle
                .send(AgentEvent::CheckpointWritten {
                    description,
                    result,
                })
                .await;
        });
    }
}

/// Fraction of the configured disk capacity used by the work directory.
fn sample_disk_usage(work_dir: &Path, capacity_mb: u64) -> Result<f64, String> {
    if capacity_mb == 0 {
        return Err("no disk capacity configured".to_string());
    }
    let mut used: u64 = 0;
    let mut stack = vec![work_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.to_string()),
        };
        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                used += metadata.len();
            }
        }
    }
    Ok((used as f64 / (capacity_mb as f64 * 1024.0 * 1024.0)).min(1.0))
}

/// Copy the meta directory into the archive location and delete it, so an
/// incompatible upgrade can start from a clean slate.
fn archive_meta_directory(
    meta_root: &Path,
    archive_dir: &Path,
    agent_id: Option<&AgentId>,
) -> Result<(), String> {
    if !meta_root.exists() {
        return Ok(());
    }
    let name = agent_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let target = archive_dir.join(name);
    copy_tree(meta_root, &target).map_err(|e| e.to_string())?;
    std::fs::remove_dir_all(meta_root).map_err(|e| e.to_string())?;
    info!(
        "archived the meta directory '{}' to '{}'",
        meta_root.display(),
        target.display()
    );
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::os::unix::fs::symlink(link, &target);
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
