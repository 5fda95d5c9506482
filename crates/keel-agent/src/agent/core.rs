use std::collections::{HashMap, VecDeque};

use keel_server::actor::{Actor, ActorAction, ActorContext};
use log::{error, info, warn};

use crate::agent::{AgentActor, AgentEvent, AgentOptions, FrameworkState};
use crate::gc::GarbageCollector;
use crate::isolation::{IsolationOptions, IsolationSink};
use crate::message::AgentInfo;
use crate::monitor::ResourceMonitor;
use crate::update::UpdateManager;

#[async_trait::async_trait]
impl Actor for AgentActor {
    type Message = AgentEvent;
    type Options = AgentOptions;

    fn name() -> &'static str {
        "AgentActor"
    }

    fn new(options: AgentOptions) -> Self {
        let info = AgentInfo {
            id: None,
            hostname: options.hostname.clone(),
            webui_hostname: options.webui_hostname.clone(),
            resources: options.resources.clone(),
            attributes: options.attributes.clone(),
            checkpoint_enabled: options.checkpoint,
        };
        let monitor = ResourceMonitor::new(options.usage_collector.clone());
        let updates = UpdateManager::new(options.update_retry.clone());
        Self {
            options,
            info,
            frameworks: HashMap::new(),
            completed_frameworks: VecDeque::new(),
            updates,
            gc: GarbageCollector::new(),
            monitor,
            coordinator: None,
            connected: false,
            recovered: false,
            pending_registration: false,
            registering: false,
            halting: false,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        info!("agent started on {}", self.info.hostname);
        info!("agent resources: {}", self.info.resources);
        if let Some(log_dir) = &self.options.log_dir {
            self.options.files.attach(log_dir, log_dir);
        }
        let isolation_options = IsolationOptions {
            work_dir: self.options.work_dir.clone(),
            resources: self.options.resources.clone(),
        };
        let sink = IsolationSink::new(ctx.handle().clone());
        if let Err(e) = self
            .options
            .isolation
            .initialize(&isolation_options, sink)
            .await
        {
            error!("failed to initialize the isolation driver: {e}");
        }
        // The disk watch is a delayed message rather than an immediate
        // check, so that a very large interval effectively disables it.
        ctx.send_with_delay(AgentEvent::CheckDiskUsage, self.options.disk_watch_interval);
        self.start_recovery(ctx);
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: AgentEvent) -> ActorAction {
        match message {
            AgentEvent::NewCoordinatorDetected { coordinator } => {
                self.handle_new_coordinator_detected(ctx, coordinator)
            }
            AgentEvent::NoCoordinatorDetected => self.handle_no_coordinator_detected(ctx),
            AgentEvent::AgentRegistered { agent_id } => self.handle_registered(ctx, agent_id),
            AgentEvent::AgentReregistered { agent_id } => {
                self.handle_reregistered(ctx, agent_id)
            }
            AgentEvent::RunTask {
                framework_info,
                framework_id,
                coordinator_pid,
                task,
            } => self.handle_run_task(ctx, framework_info, framework_id, coordinator_pid, task),
            AgentEvent::KillTask {
                framework_id,
                task_id,
            } => self.handle_kill_task(ctx, framework_id, task_id),
            AgentEvent::ShutdownFramework { framework_id, from } => {
                self.handle_shutdown_framework(ctx, framework_id, from)
            }
            AgentEvent::FrameworkToExecutor {
                agent_id,
                framework_id,
                executor_id,
                data,
            } => self.handle_framework_to_executor(ctx, agent_id, framework_id, executor_id, data),
            AgentEvent::UpdateFramework { framework_id, pid } => {
                self.handle_update_framework(ctx, framework_id, pid)
            }
            AgentEvent::StatusUpdateAcknowledgement {
                agent_id: _,
                framework_id,
                task_id,
                uuid,
            } => self.handle_status_update_acknowledgement(ctx, framework_id, task_id, uuid),
            AgentEvent::Shutdown { from } => self.handle_shutdown(ctx, from),
            AgentEvent::Ping => self.handle_ping(ctx),
            AgentEvent::RegisterExecutor {
                framework_id,
                executor_id,
                sender,
            } => self.handle_register_executor(ctx, framework_id, executor_id, sender),
            AgentEvent::ReregisterExecutor {
                framework_id,
                executor_id,
                tasks,
                updates,
                sender,
            } => self.handle_reregister_executor(
                ctx,
                framework_id,
                executor_id,
                tasks,
                updates,
                sender,
            ),
            AgentEvent::StatusUpdate { update } => {
                self.status_update(ctx, update);
                ActorAction::Continue
            }
            AgentEvent::ExecutorToFramework {
                agent_id,
                framework_id,
                executor_id,
                data,
            } => self.handle_executor_to_framework(ctx, agent_id, framework_id, executor_id, data),
            AgentEvent::ExecutorStarted {
                framework_id,
                executor_id,
                forked_pid,
            } => self.handle_executor_started(ctx, framework_id, executor_id, forked_pid),
            AgentEvent::ExecutorTerminated {
                framework_id,
                executor_id,
                exit_status,
                destroyed,
                message,
            } => self.handle_executor_terminated(
                ctx,
                framework_id,
                executor_id,
                exit_status,
                destroyed,
                message,
            ),
            AgentEvent::RetryRegistration => self.handle_retry_registration(ctx),
            AgentEvent::RegisterExecutorTimeout {
                framework_id,
                executor_id,
                run_uuid,
            } => self.handle_register_executor_timeout(ctx, framework_id, executor_id, run_uuid),
            AgentEvent::ShutdownExecutorTimeout {
                framework_id,
                executor_id,
                run_uuid,
            } => self.handle_shutdown_executor_timeout(ctx, framework_id, executor_id, run_uuid),
            AgentEvent::ReregisterExecutorTimeout => {
                self.handle_reregister_executor_timeout(ctx)
            }
            AgentEvent::CheckDiskUsage => self.handle_check_disk_usage(ctx),
            AgentEvent::StatusUpdateRetry {
                framework_id,
                task_id,
                uuid,
            } => self.handle_status_update_retry(ctx, framework_id, task_id, uuid),
            AgentEvent::RecoveredState { result } => self.handle_recovered_state(ctx, result),
            AgentEvent::RebuildRecoveredState { state } => {
                self.handle_rebuild_recovered_state(ctx, state)
            }
            AgentEvent::RecoveryComplete => self.handle_recovery_complete(ctx),
            AgentEvent::UpdateAppendComplete {
                framework_id,
                task_id,
                kind,
                result,
            } => self.handle_update_append_complete(ctx, framework_id, task_id, kind, result),
            AgentEvent::CheckpointWritten {
                description,
                result,
            } => self.handle_checkpoint_written(ctx, description, result),
            AgentEvent::GcComplete { path } => self.handle_gc_complete(ctx, path),
            AgentEvent::DiskUsageSampled { result } => {
                self.handle_disk_usage_sampled(ctx, result)
            }
        }
    }

    async fn stop(mut self, _ctx: &mut ActorContext<Self>) {
        info!("agent terminating");
        let framework_ids = self.frameworks.keys().cloned().collect::<Vec<_>>();
        for framework_id in framework_ids {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                continue;
            };
            // Checkpointed frameworks survive a graceful restart; they are
            // only shut down when the agent is halting for good.
            if !self.halting && framework.info.checkpoint_enabled {
                continue;
            }
            framework.state = FrameworkState::Terminating;
            for executor in framework.executors.values_mut() {
                executor.state = crate::agent::ExecutorState::Terminating;
                if let Some(pid) = &executor.pid {
                    if let Err(e) = pid.client.shutdown_executor().await {
                        warn!(
                            "failed to send shutdown to executor '{}' of framework \
                             {framework_id}: {e}",
                            executor.id
                        );
                    }
                }
            }
            self.updates.cleanup(&framework_id);
        }
        if let Err(e) = self.options.isolation.terminate().await {
            warn!("failed to terminate the isolation driver: {e}");
        }
    }
}
