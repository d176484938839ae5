//! Command-line interface.
//!
//! Flags form the last, highest-precedence configuration overlay. Only flags
//! that were actually given set a field, so a flag never erases a value from
//! a file with a default.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::schema::{AgentConfig, ConsulConfig, VaultConfig};
use crate::config::sources::enterprise_config;
use crate::config::{self, loader, ConfigError, ConfigProvider, RawConfigSource, SystemEnvironment, Validated};

#[derive(Parser, Debug)]
#[command(name = "cluster-agent", version)]
#[command(about = "Cluster agent: runs the server and/or client role and joins a cluster", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent
    Agent(AgentArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Start in development mode with both roles enabled
    #[arg(long)]
    pub dev: bool,

    /// Enable server mode
    #[arg(long)]
    pub server: bool,

    /// Enable client mode
    #[arg(long)]
    pub client: bool,

    /// Config file or directory; may be repeated
    #[arg(long = "config", value_name = "PATH")]
    pub config: Vec<PathBuf>,

    /// Reload when a config path changes on disk
    #[arg(long)]
    pub watch_config: bool,

    // Server flags
    #[arg(long, value_name = "N")]
    pub bootstrap_expect: Option<i32>,
    #[arg(long, value_name = "KEY")]
    pub encrypt: Option<String>,
    #[arg(long, value_name = "VERSION")]
    pub raft_protocol: Option<i32>,
    #[arg(long)]
    pub rejoin: bool,
    /// Address to join at startup; may be repeated
    #[arg(long = "join", value_name = "ADDR")]
    pub join: Vec<String>,
    /// Address or discovery descriptor to join with retries; may be repeated
    #[arg(long = "retry-join", value_name = "ADDR")]
    pub retry_join: Vec<String>,
    #[arg(long = "retry-max", value_name = "N")]
    pub retry_max: Option<u32>,
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub retry_interval: Option<Duration>,

    // Client flags
    #[arg(long, value_name = "PATH")]
    pub state_dir: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub alloc_dir: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub alloc_mounts_dir: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub host_volumes_dir: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub host_volume_plugin_dir: Option<String>,
    #[arg(long, value_name = "CLASS")]
    pub node_class: Option<String>,
    #[arg(long, value_name = "POOL")]
    pub node_pool: Option<String>,
    /// Comma-separated server addresses; replaces any configured list
    #[arg(long, value_name = "ADDRS")]
    pub servers: Option<String>,
    /// key=value client metadata; may be repeated
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    pub meta: Vec<String>,
    #[arg(long, value_name = "IFACE")]
    pub network_interface: Option<String>,
    #[arg(long, value_name = "FAMILY")]
    pub preferred_address_family: Option<String>,
    #[arg(long, value_name = "MBITS")]
    pub network_speed: Option<i32>,

    // Agent flags
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,
    #[arg(long = "dc", value_name = "DATACENTER")]
    pub datacenter: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub plugin_dir: Option<String>,
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
    #[arg(long)]
    pub log_json: bool,
    #[arg(long = "node", value_name = "NAME")]
    pub node_name: Option<String>,

    // External clusters
    #[arg(long, value_name = "ADDR")]
    pub consul_address: Option<String>,
    #[arg(long, value_name = "TOKEN")]
    pub consul_token: Option<String>,
    #[arg(long)]
    pub vault_enabled: bool,
    #[arg(long, value_name = "ADDR")]
    pub vault_address: Option<String>,
    #[arg(long, value_name = "NAMESPACE")]
    pub vault_namespace: Option<String>,

    // ACL
    #[arg(long)]
    pub acl_enabled: bool,
    #[arg(long, value_name = "TOKEN")]
    pub acl_replication_token: Option<String>,
}

impl AgentArgs {
    /// The configuration overlay these flags describe.
    pub fn overlay(&self) -> Result<AgentConfig, ConfigError> {
        let mut config = AgentConfig {
            region: self.region.clone(),
            datacenter: self.datacenter.clone(),
            name: self.node_name.clone(),
            data_dir: self.data_dir.clone(),
            plugin_dir: self.plugin_dir.clone(),
            bind_addr: self.bind.clone(),
            log_level: self.log_level.clone(),
            log_json: self.log_json.then_some(true),
            ..AgentConfig::default()
        };

        let server = &mut config.server;
        server.enabled = self.server.then_some(true);
        server.bootstrap_expect = self.bootstrap_expect;
        server.encrypt_key = self.encrypt.clone();
        server.raft_protocol = self.raft_protocol;
        server.rejoin_after_leave = self.rejoin.then_some(true);
        server.server_join.start_join = self.join.clone();
        server.server_join.retry_join = self.retry_join.clone();
        server.server_join.retry_max_attempts = self.retry_max;
        server.server_join.retry_interval = self.retry_interval;

        let client = &mut config.client;
        client.enabled = self.client.then_some(true);
        client.state_dir = self.state_dir.clone();
        client.alloc_dir = self.alloc_dir.clone();
        client.alloc_mounts_dir = self.alloc_mounts_dir.clone();
        client.host_volumes_dir = self.host_volumes_dir.clone();
        client.host_volume_plugin_dir = self.host_volume_plugin_dir.clone();
        client.node_class = self.node_class.clone();
        client.node_pool = self.node_pool.clone();
        client.network_interface = self.network_interface.clone();
        client.preferred_address_family = self.preferred_address_family.clone();
        client.network_speed = self.network_speed;
        if let Some(servers) = &self.servers {
            client.servers = split_list(servers);
        }
        for pair in &self.meta {
            let (key, value) = parse_meta(pair)?;
            client.meta.insert(key, value);
        }

        if self.consul_address.is_some() || self.consul_token.is_some() {
            config.consuls = vec![ConsulConfig {
                address: self.consul_address.clone(),
                token: self.consul_token.clone(),
                ..ConsulConfig::default()
            }];
        }
        if self.vault_enabled || self.vault_address.is_some() || self.vault_namespace.is_some() {
            config.vaults = vec![VaultConfig {
                enabled: self.vault_enabled.then_some(true),
                address: self.vault_address.clone(),
                namespace: self.vault_namespace.clone(),
                ..VaultConfig::default()
            }];
        }

        config.acl.enabled = self.acl_enabled.then_some(true);
        config.acl.replication_token = self.acl_replication_token.clone();

        Ok(config)
    }
}

impl AgentArgs {
    /// Ordered sources plus the warnings produced while reading files.
    fn sources(&self) -> Result<(Vec<RawConfigSource>, Vec<String>), ConfigError> {
        let overlay = self.overlay()?;
        let loaded = loader::load_paths(&self.config)?;

        let mut sources = Vec::with_capacity(loaded.sources.len() + 3);
        sources.push(if self.dev {
            RawConfigSource::DevMode
        } else {
            RawConfigSource::Defaults
        });
        sources.push(RawConfigSource::Enterprise(enterprise_config()));
        sources.extend(loaded.sources);
        sources.push(RawConfigSource::Cli(overlay));
        Ok((sources, loaded.warnings))
    }
}

fn with_file_warnings(mut file_warnings: Vec<String>, mut validated: Validated) -> Validated {
    file_warnings.append(&mut validated.warnings);
    validated.warnings = file_warnings;
    validated
}

impl ConfigProvider for AgentArgs {
    fn load(&self) -> Result<Validated, ConfigError> {
        let (sources, warnings) = self.sources()?;
        let validated = config::build(sources, &SystemEnvironment)?;
        Ok(with_file_warnings(warnings, validated))
    }

    fn reload(&self, current_log_level: &str) -> Result<Validated, ConfigError> {
        let (sources, warnings) = self.sources()?;
        let validated = config::build_reload(sources, &SystemEnvironment, current_log_level)?;
        Ok(with_file_warnings(warnings, validated))
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        self.config.clone()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_meta(pair: &str) -> Result<(String, String), ConfigError> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::Flag(format!(
            "error parsing client meta {pair:?}: expected key=value"
        ))),
    }
}
