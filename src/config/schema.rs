//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the agent.
//! Every scalar leaf is an `Option` so that a configuration source can say
//! "not set" and leave the accumulated value alone during assembly. The
//! `server` and `client` blocks are always present.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the agent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Region the agent belongs to.
    pub region: Option<String>,

    /// Datacenter the agent belongs to.
    pub datacenter: Option<String>,

    /// Node name, defaults to the hostname.
    pub name: Option<String>,

    /// Directory for persistent state.
    pub data_dir: Option<String>,

    /// Directory scanned for plugins.
    pub plugin_dir: Option<String>,

    /// Address every network service binds to unless overridden.
    pub bind_addr: Option<String>,

    /// Log level (OFF, TRACE, DEBUG, INFO, WARN, ERROR).
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    pub log_json: Option<bool>,

    /// Attempt a graceful leave on SIGINT and external stop requests.
    pub leave_on_interrupt: Option<bool>,

    /// Attempt a graceful leave on SIGTERM.
    pub leave_on_terminate: Option<bool>,

    /// Disable the background update check.
    pub disable_update_check: Option<bool>,

    /// Do not send the anonymous signature with update checks.
    pub disable_anonymous_signature: Option<bool>,

    /// Set by the dev-mode source only.
    #[serde(skip)]
    pub dev_mode: Option<bool>,

    pub ports: Ports,
    pub addresses: Addresses,
    pub advertise: Addresses,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub tls: TlsConfig,
    pub telemetry: TelemetryConfig,
    pub rpc: RpcConfig,
    pub acl: AclConfig,

    /// External coordination clusters, merged by name.
    #[serde(rename = "consul")]
    pub consuls: Vec<ConsulConfig>,

    /// External secrets clusters, merged by name.
    #[serde(rename = "vault")]
    pub vaults: Vec<VaultConfig>,

    /// Files this configuration was loaded from, in load order.
    #[serde(skip)]
    pub files: Vec<String>,
}

impl AgentConfig {
    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode.unwrap_or(false)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("INFO")
    }

    pub fn log_json(&self) -> bool {
        self.log_json.unwrap_or(false)
    }

    pub fn leave_on_interrupt(&self) -> bool {
        self.leave_on_interrupt.unwrap_or(false)
    }

    pub fn leave_on_terminate(&self) -> bool {
        self.leave_on_terminate.unwrap_or(false)
    }

    pub fn update_check_enabled(&self) -> bool {
        !self.disable_update_check.unwrap_or(false)
    }

    /// The `default` coordination cluster block, if configured.
    pub fn default_consul(&self) -> Option<&ConsulConfig> {
        self.consuls.iter().find(|c| c.name == DEFAULT_CLUSTER)
    }

    /// The `default` secrets cluster block, if configured.
    pub fn default_vault(&self) -> Option<&VaultConfig> {
        self.vaults.iter().find(|v| v.name == DEFAULT_CLUSTER)
    }
}

/// Name given to the unnamed external cluster block.
pub const DEFAULT_CLUSTER: &str = "default";

/// Per-service ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ports {
    pub http: Option<u16>,
    pub rpc: Option<u16>,
    pub serf: Option<u16>,
}

/// Per-service addresses (bind or advertise).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Addresses {
    pub http: Option<String>,
    pub rpc: Option<String>,
    pub serf: Option<String>,
}

/// Server role configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub enabled: Option<bool>,

    /// Number of servers to wait for before bootstrapping.
    pub bootstrap_expect: Option<i32>,

    /// Base64 gossip encryption key.
    #[serde(rename = "encrypt")]
    pub encrypt_key: Option<String>,

    pub raft_protocol: Option<i32>,

    /// Never used; only warned about.
    pub protocol_version: Option<i32>,

    pub rejoin_after_leave: Option<bool>,

    pub oidc_issuer: Option<String>,

    pub license_path: Option<String>,

    /// License content from the environment; never read from files.
    #[serde(skip)]
    pub license_env: Option<String>,

    /// Deprecated: use `server_join.start_join`.
    pub start_join: Vec<String>,

    /// Deprecated: use `server_join.retry_join`.
    pub retry_join: Vec<String>,

    /// Deprecated: use `server_join.retry_max`.
    #[serde(rename = "retry_max")]
    pub retry_max_attempts: Option<u32>,

    /// Deprecated: use `server_join.retry_interval`.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Option<Duration>,

    pub server_join: ServerJoin,

    #[serde(rename = "default_scheduler_config")]
    pub scheduler: SchedulerConfig,
}

impl ServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Whether any deprecated flat join field is populated.
    pub fn has_legacy_join(&self) -> bool {
        !self.start_join.is_empty()
            || !self.retry_join.is_empty()
            || self.retry_max_attempts.is_some()
            || self.retry_interval.is_some()
    }
}

/// Structured join block, shared by the server and client roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerJoin {
    /// Addresses joined once, synchronously, at startup.
    pub start_join: Vec<String>,

    /// Address literals or discovery descriptors retried in the background.
    pub retry_join: Vec<String>,

    /// Attempts before giving up; 0 retries forever.
    #[serde(rename = "retry_max")]
    pub retry_max_attempts: Option<u32>,

    #[serde(with = "humantime_serde")]
    pub retry_interval: Option<Duration>,
}

impl ServerJoin {
    pub fn is_empty(&self) -> bool {
        self == &ServerJoin::default()
    }
}

/// Scheduler defaults applied when the cluster is first bootstrapped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub scheduler_algorithm: Option<String>,
    pub memory_oversubscription_enabled: Option<bool>,
    pub reject_job_registration: Option<bool>,
    pub pause_eval_broker: Option<bool>,
}

/// Client role configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub enabled: Option<bool>,
    pub state_dir: Option<String>,
    pub alloc_dir: Option<String>,
    pub alloc_mounts_dir: Option<String>,
    pub host_volumes_dir: Option<String>,
    pub host_volume_plugin_dir: Option<String>,
    pub node_class: Option<String>,
    pub node_pool: Option<String>,
    pub network_interface: Option<String>,
    pub network_speed: Option<i32>,

    /// `ipv4`, `ipv6` or empty.
    pub preferred_address_family: Option<String>,

    /// Known servers; a later source replaces the whole list.
    pub servers: Vec<String>,

    /// Node metadata, merged key by key.
    pub meta: BTreeMap<String, String>,

    pub server_join: ServerJoin,

    pub min_dynamic_port: Option<i32>,
    pub max_dynamic_port: Option<i32>,

    pub reserved: Reserved,

    #[serde(rename = "host_network")]
    pub host_networks: Vec<HostNetwork>,

    #[serde(rename = "host_volume")]
    pub host_volumes: Vec<HostVolume>,

    pub artifact: ArtifactConfig,

    pub drain: DrainConfig,
}

impl ClientConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// Resources withheld from scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Reserved {
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub disk: Option<u32>,
    pub reserved_ports: Option<String>,
}

/// A named host network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostNetwork {
    pub name: String,
    pub cidr: Option<String>,
    pub interface: Option<String>,
    pub reserved_ports: Option<String>,
}

/// A host directory exposed to workloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostVolume {
    pub name: String,
    pub path: Option<String>,
    pub read_only: Option<bool>,
}

/// Limits applied when fetching task artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactConfig {
    pub http_read_timeout: Option<String>,
    pub http_max_size: Option<String>,
    pub gcs_timeout: Option<String>,
    pub git_timeout: Option<String>,
    pub hg_timeout: Option<String>,
    pub s3_timeout: Option<String>,
    pub decompression_file_count_limit: Option<i64>,
    pub decompression_size_limit: Option<String>,
    pub disable_filesystem_isolation: Option<bool>,
}

/// Node drain behaviour on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainConfig {
    /// Added on top of the graceful shutdown timeout.
    #[serde(with = "humantime_serde")]
    pub deadline: Option<Duration>,
    pub ignore_system_jobs: Option<bool>,
    pub force: Option<bool>,
}

/// TLS configuration for HTTP and RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(rename = "http")]
    pub enable_http: Option<bool>,
    #[serde(rename = "rpc")]
    pub enable_rpc: Option<bool>,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub verify_server_hostname: Option<bool>,
    pub verify_https_client: Option<bool>,
}

impl TlsConfig {
    pub fn is_empty(&self) -> bool {
        self == &TlsConfig::default()
    }

    /// Mutual TLS is in force for both HTTP and RPC.
    pub fn is_complete(&self) -> bool {
        self.enable_http.unwrap_or(false) && self.enable_rpc.unwrap_or(false)
    }

    pub fn http_enabled(&self) -> bool {
        self.enable_http.unwrap_or(false)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Interval of the in-memory sink, e.g. "10s".
    pub collection_interval: Option<String>,

    /// Retention of the in-memory sink, e.g. "1m".
    pub in_memory_retention_period: Option<String>,

    pub disable_hostname: Option<bool>,
    pub use_node_name: Option<bool>,

    /// Entries of the form `+prefix` (allow) or `-prefix` (block).
    pub prefix_filter: Vec<String>,
    pub filter_default: Option<bool>,

    pub statsite_address: Option<String>,
    pub statsd_address: Option<String>,
    pub datadog_address: Option<String>,
    pub datadog_tags: Vec<String>,
    pub prometheus_metrics: Option<bool>,

    pub circonus_api_token: Option<String>,
    pub circonus_api_app: Option<String>,
    pub circonus_api_url: Option<String>,
    pub circonus_submission_interval: Option<String>,
    pub circonus_submission_url: Option<String>,
    pub circonus_check_id: Option<String>,
    pub circonus_check_display_name: Option<String>,
    pub circonus_check_search_tag: Option<String>,
    pub circonus_broker_id: Option<String>,
}

/// Multiplexed RPC stream settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    pub accept_backlog: Option<i32>,
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub connection_write_timeout: Option<Duration>,
    pub max_stream_window_size: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub stream_open_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub stream_close_timeout: Option<Duration>,
}

/// Access control settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AclConfig {
    pub enabled: Option<bool>,
    pub replication_token: Option<String>,
}

/// Connection to an external service-coordination cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsulConfig {
    pub name: String,
    pub address: Option<String>,
    pub token: Option<String>,
    pub auth: Option<String>,
    pub ssl: Option<bool>,
    pub verify_ssl: Option<bool>,
    pub server_auto_join: Option<bool>,
    pub client_auto_join: Option<bool>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLUSTER.to_string(),
            address: None,
            token: None,
            auth: None,
            ssl: None,
            verify_ssl: None,
            server_auto_join: None,
            client_auto_join: None,
        }
    }
}

/// Connection to an external secrets cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    pub name: String,
    pub enabled: Option<bool>,
    pub address: Option<String>,
    pub namespace: Option<String>,
    pub role: Option<String>,
    pub tls_skip_verify: Option<bool>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLUSTER.to_string(),
            enabled: None,
            address: None,
            namespace: None,
            role: None,
            tls_skip_verify: None,
        }
    }
}
