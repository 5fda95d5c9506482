use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::AgentResult;
use crate::id::{ExecutorId, FrameworkId};
use crate::message::ExecutorInfo;

/// One sample of an executor's resource consumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpus_user_secs: f64,
    pub cpus_system_secs: f64,
    pub mem_rss_mb: u64,
    pub timestamp: f64,
}

/// Samples one executor's resource usage. Production collectors read from
/// the isolation layer; tests supply canned samples.
#[async_trait::async_trait]
pub trait UsageCollector: Send + Sync + 'static {
    async fn usage(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> AgentResult<ResourceUsage>;
}

/// Periodically samples watched executors. Sampling failures are logged and
/// never propagated; the latest good sample per executor is kept for the
/// read-only state endpoints.
pub struct ResourceMonitor {
    collector: Arc<dyn UsageCollector>,
    watches: HashMap<(FrameworkId, ExecutorId), oneshot::Sender<()>>,
    samples: Arc<Mutex<HashMap<(FrameworkId, ExecutorId), ResourceUsage>>>,
}

impl ResourceMonitor {
    pub fn new(collector: Arc<dyn UsageCollector>) -> Self {
        Self {
            collector,
            watches: HashMap::new(),
            samples: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start sampling an executor every `interval`.
    /// Watching an already-watched executor restarts its sampling loop.
    pub fn watch(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        _executor_info: ExecutorInfo,
        interval: Duration,
    ) {
        let key = (framework_id.clone(), executor_id.clone());
        if self.watches.remove(&key).is_some() {
            warn!(
                "restarting resource monitoring for executor '{executor_id}' \
                 of framework {framework_id}"
            );
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.watches.insert(key.clone(), stop_tx);
        let collector = Arc::clone(&self.collector);
        let samples = Arc::clone(&self.samples);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match collector.usage(&framework_id, &executor_id).await {
                    Ok(usage) => {
                        debug!(
                            "sampled executor '{executor_id}' of framework {framework_id}: \
                             rss {} MB",
                            usage.mem_rss_mb
                        );
                        if let Ok(mut samples) = samples.lock() {
                            samples.insert(
                                (framework_id.clone(), executor_id.clone()),
                                usage,
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            "failed to sample executor '{executor_id}' of framework \
                             {framework_id}: {e}"
                        );
                    }
                }
            }
        });
    }

    /// Stop sampling an executor; its last sample is dropped.
    pub fn unwatch(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let key = (framework_id.clone(), executor_id.clone());
        if self.watches.remove(&key).is_none() {
            warn!(
                "cannot unwatch executor '{executor_id}' of framework {framework_id} \
                 which is not being monitored"
            );
        }
        if let Ok(mut samples) = self.samples.lock() {
            samples.remove(&key);
        }
    }

    pub fn latest_sample(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Option<ResourceUsage> {
        self.samples
            .lock()
            .ok()?
            .get(&(framework_id.clone(), executor_id.clone()))
            .cloned()
    }

    pub fn watched_count(&self) -> usize {
        self.watches.len()
    }
}
