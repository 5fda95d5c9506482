use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_common::config::AppConfig;
use keel_server::retry::RetryStrategy;

use crate::error::{AgentError, AgentResult};
use crate::files::FileServing;
use crate::isolation::IsolationDriver;
use crate::message::ExecutorPidResolver;
use crate::metrics::Metrics;
use crate::monitor::UsageCollector;
use crate::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverMode {
    /// Reconnect with executors that survived the restart.
    Reconnect,
    /// Kill all recovered executors, archive the meta directory, and exit;
    /// used for incompatible upgrades.
    Cleanup,
}

impl std::str::FromStr for RecoverMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconnect" => Ok(Self::Reconnect),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(AgentError::InvalidArgument(format!(
                "unknown recover mode '{other}'"
            ))),
        }
    }
}

pub struct AgentOptions {
    pub work_dir: PathBuf,
    pub hostname: String,
    pub webui_hostname: String,
    pub checkpoint: bool,
    pub recover_mode: RecoverMode,
    pub safe: bool,
    pub resources: Resources,
    pub attributes: BTreeMap<String, String>,
    pub gc_delay: Duration,
    pub disk_watch_interval: Duration,
    pub executor_registration_timeout: Duration,
    pub executor_shutdown_grace_period: Duration,
    pub resource_monitoring_interval: Duration,
    pub launcher_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub update_retry: RetryStrategy,
    // Collaborators specified at their interfaces only.
    pub isolation: Arc<dyn IsolationDriver>,
    pub files: Arc<dyn FileServing>,
    pub usage_collector: Arc<dyn UsageCollector>,
    pub executor_resolver: Arc<dyn ExecutorPidResolver>,
    pub metrics: Arc<Metrics>,
}

impl AgentOptions {
    pub fn try_new(
        config: &AppConfig,
        isolation: Arc<dyn IsolationDriver>,
        files: Arc<dyn FileServing>,
        usage_collector: Arc<dyn UsageCollector>,
        executor_resolver: Arc<dyn ExecutorPidResolver>,
    ) -> AgentResult<Self> {
        let agent = &config.agent;
        let webui_hostname = if agent.webui_hostname.is_empty() {
            agent.hostname.clone()
        } else {
            agent.webui_hostname.clone()
        };
        let log_dir = if agent.log_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&agent.log_dir))
        };
        Ok(Self {
            work_dir: PathBuf::from(&agent.work_dir),
            hostname: agent.hostname.clone(),
            webui_hostname,
            checkpoint: agent.checkpoint,
            recover_mode: agent.recover.parse()?,
            safe: agent.safe,
            resources: Resources::parse(&agent.resources)?,
            attributes: parse_attributes(&agent.attributes)?,
            gc_delay: Duration::from_secs_f64(agent.gc_delay_weeks * 7.0 * 24.0 * 3600.0),
            disk_watch_interval: Duration::from_secs(agent.disk_watch_interval_secs),
            executor_registration_timeout: Duration::from_secs(
                agent.executor_registration_timeout_secs,
            ),
            executor_shutdown_grace_period: Duration::from_secs(
                agent.executor_shutdown_grace_period_secs,
            ),
            resource_monitoring_interval: Duration::from_secs(
                agent.resource_monitoring_interval_secs,
            ),
            launcher_dir: PathBuf::from(&agent.launcher_dir),
            log_dir,
            update_retry: RetryStrategy::from(&agent.update_retry),
            isolation,
            files,
            usage_collector,
            executor_resolver,
            metrics: Arc::new(Metrics::new()),
        })
    }
}

/// Parse semicolon-separated `key:value` attribute pairs.
fn parse_attributes(value: &str) -> AgentResult<BTreeMap<String, String>> {
    let mut attributes = BTreeMap::new();
    for part in value.split(';').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part.split_once(':').ok_or_else(|| {
            AgentError::InvalidArgument(format!("malformed attribute '{part}'"))
        })?;
        attributes.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(attributes)
}
