use keel_server::actor::{ActorAction, ActorContext};
use log::{error, info, warn};

use crate::agent::{AgentActor, AgentEvent, ExecutorState, Framework, RecoverMode};
use crate::checkpoint::{state as checkpoint_state, AgentState, RecoveredFramework};
use crate::constants::EXECUTOR_REREGISTER_TIMEOUT;
use crate::error::AgentError;
use crate::id::{ExecutorId, FrameworkId, RunUuid};

/// What to do for one recovered executor once the models are rebuilt.
struct RecoveredExecutorAction {
    executor_id: ExecutorId,
    info: crate::message::ExecutorInfo,
    run_uuid: RunUuid,
    directory: std::path::PathBuf,
    recovered_pid: Option<String>,
}

impl AgentActor {
    /// Kick off recovery: read the checkpoint layout on the blocking pool
    /// and re-enter the actor with the parsed state.
    pub(super) fn start_recovery(&mut self, ctx: &mut ActorContext<Self>) {
        let meta_root = self.meta_root();
        let safe = self.options.safe;
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || checkpoint_state::recover(&meta_root, safe))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()));
            let _ = handle.send(AgentEvent::RecoveredState { result }).await;
        });
    }

    pub(super) fn handle_recovered_state(
        &mut self,
        ctx: &mut ActorContext<Self>,
        result: Result<Option<AgentState>, String>,
    ) -> ActorAction {
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                error!("failed to recover agent state: {e}");
                return ActorAction::Stop;
            }
        };
        let Some(state) = state else {
            // No meta directory: first checkpointed boot, or the previous
            // run cleaned up. Sweep any stale isolates and be done.
            self.dispatch_isolation_recover(ctx, None);
            return ActorAction::Continue;
        };
        let Some(recovered_info) = state.info.clone() else {
            // The agent died before checkpointing its info.
            self.dispatch_isolation_recover(ctx, None);
            return ActorAction::Continue;
        };

        if self.options.recover_mode == RecoverMode::Reconnect
            && !self.info.compatible_with(&recovered_info)
        {
            let e = AgentError::IncompatibleAgentInfo {
                old: format!("{recovered_info:?}"),
                new: format!("{:?}", self.info),
            };
            error!("{e}");
            return ActorAction::Stop;
        }

        // Adopt the recovered info, id included.
        self.info = recovered_info;
        let meta_root = self.meta_root();
        self.updates.recover(&meta_root, &state);
        self.dispatch_isolation_recover(ctx, Some(state));
        ActorAction::Continue
    }

    fn dispatch_isolation_recover(
        &mut self,
        ctx: &mut ActorContext<Self>,
        state: Option<AgentState>,
    ) {
        let isolation = self.options.isolation.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            if let Err(e) = isolation.recover(state.as_ref()).await {
                warn!("failed to recover the isolation driver: {e}");
            }
            let event = match state {
                Some(state) => AgentEvent::RebuildRecoveredState { state },
                None => AgentEvent::RecoveryComplete,
            };
            let _ = handle.send(event).await;
        });
    }

    pub(super) fn handle_rebuild_recovered_state(
        &mut self,
        ctx: &mut ActorContext<Self>,
        state: AgentState,
    ) -> ActorAction {
        for (_, framework) in state.frameworks {
            self.recover_framework(ctx, framework);
        }
        if self.options.recover_mode == RecoverMode::Reconnect {
            // Give executors a grace period to re-register; the timeout
            // kills the rest and only then unblocks registration.
            ctx.send_with_delay(
                AgentEvent::ReregisterExecutorTimeout,
                EXECUTOR_REREGISTER_TIMEOUT,
            );
        } else {
            ctx.send(AgentEvent::RecoveryComplete);
        }
        ActorAction::Continue
    }

    fn recover_framework(&mut self, ctx: &mut ActorContext<Self>, state: RecoveredFramework) {
        let framework_id = state.id.clone();
        let Some(info) = state.info else {
            warn!(
                "skipping recovery of framework {framework_id} because its info \
                 cannot be recovered"
            );
            self.options
                .metrics
                .recovery_errors
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        };
        let pid = state.pid.unwrap_or_else(|| {
            warn!("recovered framework {framework_id} has no checkpointed pid");
            String::new()
        });
        info!("recovering framework {framework_id}");
        let Some(agent_id) = self.info.id.clone() else {
            return;
        };
        let mut framework = Framework::new(framework_id.clone(), info, pid);
        let mut actions = vec![];
        for executor_state in state.executors.values() {
            let Some(executor) = framework.recover_executor(
                &agent_id,
                &self.options.work_dir,
                executor_state,
            ) else {
                continue;
            };
            actions.push(RecoveredExecutorAction {
                executor_id: executor.id.clone(),
                info: executor.info.clone(),
                run_uuid: executor.run_uuid,
                directory: executor.directory.clone(),
                recovered_pid: executor.recovered_pid.clone(),
            });
        }
        self.frameworks.insert(framework_id.clone(), framework);

        let reconnect = self.options.recover_mode == RecoverMode::Reconnect;
        for action in actions {
            self.options.files.attach(&action.directory, &action.directory);
            self.monitor.watch(
                framework_id.clone(),
                action.executor_id.clone(),
                action.info.clone(),
                self.options.resource_monitoring_interval,
            );
            if reconnect {
                self.reconnect_executor(ctx, &framework_id, action);
            } else {
                self.shutdown_recovered_executor(ctx, &framework_id, action);
            }
        }
    }

    /// Ask a surviving executor to reconnect to the restarted agent.
    fn reconnect_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
        action: RecoveredExecutorAction,
    ) {
        let executor_id = action.executor_id;
        let Some(pid) = action.recovered_pid else {
            info!(
                "unable to reconnect to executor '{executor_id}' of framework \
                 {framework_id} because no libprocess pid was found"
            );
            return;
        };
        let handle = match self.options.executor_resolver.connect(&pid) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("failed to resolve executor pid {pid}: {e}");
                return;
            }
        };
        info!(
            "sending reconnect request to executor '{executor_id}' of framework \
             {framework_id} at {pid}"
        );
        let agent_id = self.info.id.clone().unwrap_or_else(|| crate::id::AgentId::new(""));
        ctx.spawn(async move {
            if let Err(e) = handle.client.reconnect_executor(&agent_id).await {
                warn!("failed to send reconnect request: {e}");
            }
        });
    }

    /// In cleanup mode recovered executors are not reconnected: ask them to
    /// shut down when they can be reached, kill them otherwise.
    fn shutdown_recovered_executor(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
        action: RecoveredExecutorAction,
    ) {
        let executor_id = action.executor_id;
        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            if let Some(executor) = framework.get_executor_mut(&executor_id) {
                executor.state = ExecutorState::Terminating;
            }
        }
        match action.recovered_pid {
            Some(pid) => {
                info!(
                    "sending shutdown to recovered executor '{executor_id}' of \
                     framework {framework_id} at {pid}"
                );
                match self.options.executor_resolver.connect(&pid) {
                    Ok(handle) => {
                        ctx.spawn(async move {
                            if let Err(e) = handle.client.shutdown_executor().await {
                                warn!("failed to send executor shutdown: {e}");
                            }
                        });
                        ctx.send_with_delay(
                            AgentEvent::ShutdownExecutorTimeout {
                                framework_id: framework_id.clone(),
                                executor_id,
                                run_uuid: action.run_uuid,
                            },
                            self.options.executor_shutdown_grace_period,
                        );
                    }
                    Err(e) => {
                        warn!("failed to resolve executor pid {pid}: {e}");
                        self.dispatch_kill_executor(
                            ctx,
                            framework_id.clone(),
                            executor_id,
                        );
                    }
                }
            }
            None => {
                info!(
                    "killing recovered executor '{executor_id}' of framework \
                     {framework_id} because no libprocess pid was found"
                );
                self.dispatch_kill_executor(ctx, framework_id.clone(), executor_id);
            }
        }
    }

    /// The grace period for executor re-registration expired: kill every
    /// executor that never came back, then declare recovery finished.
    pub(super) fn handle_reregister_executor_timeout(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        info!("cleaning up un-reregistered executors");
        let mut kills = vec![];
        for framework in self.frameworks.values_mut() {
            for executor in framework.executors.values_mut() {
                if executor.state == ExecutorState::Registering && executor.pid.is_none() {
                    info!(
                        "killing un-reregistered executor '{}' of framework {}",
                        executor.id, framework.id
                    );
                    executor.state = ExecutorState::Terminating;
                    kills.push((framework.id.clone(), executor.id.clone()));
                }
            }
        }
        for (framework_id, executor_id) in kills {
            self.dispatch_kill_executor(ctx, framework_id, executor_id);
        }
        self.finish_recovery(ctx);
        ActorAction::Continue
    }

    pub(super) fn handle_recovery_complete(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        self.finish_recovery(ctx);
        ActorAction::Continue
    }

    fn finish_recovery(&mut self, ctx: &mut ActorContext<Self>) {
        if self.recovered {
            return;
        }
        self.recovered = true;
        info!("finished recovery");
        if self.pending_registration
            && self.options.recover_mode == RecoverMode::Reconnect
            && self.coordinator.is_some()
        {
            self.start_registration(ctx);
        }
        self.pending_registration = false;
    }
}
