//! Configuration sources and their built-in contents.
//!
//! Sources are applied in order by [`assemble`](crate::config::merge::assemble):
//! defaults (or the dev-mode overlay), the enterprise overlay, each parsed
//! file, then the CLI-derived overlay.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::schema::{AgentConfig, ConsulConfig, SchedulerConfig, VaultConfig};

pub const DEFAULT_HTTP_PORT: u16 = 4646;
pub const DEFAULT_RPC_PORT: u16 = 4647;
pub const DEFAULT_SERF_PORT: u16 = 4648;
pub const DEFAULT_MIN_DYNAMIC_PORT: i32 = 20_000;
pub const DEFAULT_MAX_DYNAMIC_PORT: i32 = 32_000;

/// One layer of configuration. Order of application is significant.
#[derive(Debug, Clone)]
pub enum RawConfigSource {
    /// Built-in defaults.
    Defaults,
    /// Built-in single-process development configuration.
    DevMode,
    /// Feature overlay applied on top of the base.
    Enterprise(AgentConfig),
    /// One parsed configuration file.
    File { path: PathBuf, config: AgentConfig },
    /// Overlay derived from command-line flags.
    Cli(AgentConfig),
}

impl RawConfigSource {
    /// The overlay this source contributes.
    pub fn into_config(self) -> AgentConfig {
        match self {
            RawConfigSource::Defaults => default_config(),
            RawConfigSource::DevMode => dev_config(),
            RawConfigSource::Enterprise(config) | RawConfigSource::Cli(config) => config,
            RawConfigSource::File { path, mut config } => {
                config.files = vec![path.display().to_string()];
                config
            }
        }
    }
}

/// Built-in defaults for a production agent.
pub fn default_config() -> AgentConfig {
    let mut config = AgentConfig {
        region: Some("global".to_string()),
        datacenter: Some("dc1".to_string()),
        bind_addr: Some("0.0.0.0".to_string()),
        log_level: Some("INFO".to_string()),
        log_json: Some(false),
        leave_on_interrupt: Some(false),
        leave_on_terminate: Some(false),
        disable_update_check: Some(false),
        disable_anonymous_signature: Some(false),
        consuls: vec![ConsulConfig::default()],
        vaults: vec![VaultConfig::default()],
        ..AgentConfig::default()
    };

    config.ports.http = Some(DEFAULT_HTTP_PORT);
    config.ports.rpc = Some(DEFAULT_RPC_PORT);
    config.ports.serf = Some(DEFAULT_SERF_PORT);

    config.server.enabled = Some(false);
    config.server.scheduler = SchedulerConfig {
        scheduler_algorithm: Some("binpack".to_string()),
        ..SchedulerConfig::default()
    };

    config.client.enabled = Some(false);
    config.client.network_speed = Some(0);
    config.client.min_dynamic_port = Some(DEFAULT_MIN_DYNAMIC_PORT);
    config.client.max_dynamic_port = Some(DEFAULT_MAX_DYNAMIC_PORT);

    config.telemetry.collection_interval = Some("10s".to_string());
    config.telemetry.in_memory_retention_period = Some("1m".to_string());

    config
}

/// Defaults with both roles enabled on the loopback interface.
pub fn dev_config() -> AgentConfig {
    let mut config = default_config();
    config.dev_mode = Some(true);
    config.bind_addr = Some("127.0.0.1".to_string());
    config.log_level = Some("DEBUG".to_string());
    config.disable_update_check = Some(true);
    config.server.enabled = Some(true);
    config.server.bootstrap_expect = Some(1);
    config.client.enabled = Some(true);
    config.client.servers = vec![format!("127.0.0.1:{DEFAULT_RPC_PORT}")];
    config.client.meta.insert("dev".to_string(), "true".to_string());
    config
}

/// Feature overlay shipped with the base build. Empty by default.
pub fn enterprise_config() -> AgentConfig {
    AgentConfig::default()
}

/// Read-only view of process environment variables.
pub trait Environment {
    /// Returns the variable's value, treating empty as unset.
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

pub const ENV_VAULT_NAMESPACE: &str = "VAULT_NAMESPACE";
pub const ENV_LICENSE: &str = "NOMAD_LICENSE";
pub const ENV_LICENSE_PATH: &str = "NOMAD_LICENSE_PATH";
