use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
}

impl AppConfig {
    /// Load the configuration from the embedded defaults merged with
    /// `KEEL_`-prefixed environment variables.
    /// Nested keys use a double underscore, e.g. `KEEL_AGENT__WORK_DIR`.
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("KEEL_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub work_dir: String,
    pub hostname: String,
    /// The hostname to report for web UI purposes.
    /// An empty string means the agent hostname is reused.
    pub webui_hostname: String,
    pub checkpoint: bool,
    /// The recovery mode, either `reconnect` or `cleanup`.
    pub recover: String,
    pub safe: bool,
    /// The agent resources in the `cpus:…;mem:…;disk:…;ports:[…]` syntax.
    /// An empty string means the built-in defaults.
    pub resources: String,
    /// Semicolon-separated `key:value` attribute pairs.
    pub attributes: String,
    pub gc_delay_weeks: f64,
    pub disk_watch_interval_secs: u64,
    pub executor_registration_timeout_secs: u64,
    pub executor_shutdown_grace_period_secs: u64,
    pub resource_monitoring_interval_secs: u64,
    /// The directory where the executor launcher binary is resolved from.
    pub launcher_dir: String,
    /// The directory for agent logs.
    /// An empty string means logs are not exposed through the file service.
    pub log_dir: String,
    pub update_retry: RetryStrategy,
}

/// Delay policy for retried operations. Attempts are not counted: the
/// retried operation runs until it succeeds or its purpose goes away.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        delay_secs: u64,
    },
    ExponentialBackoff {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        factor: u32,
    },
}
