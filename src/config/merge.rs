//! Right-biased configuration assembly.
//!
//! # Merge Rules
//! - A scalar set in a later source replaces the accumulated value; an unset
//!   scalar leaves it alone.
//! - Nested blocks merge field by field.
//! - Lists replace wholesale when the later source supplies a non-empty list.
//! - Maps merge key by key.
//! - Named block lists (external clusters, host volumes, host networks)
//!   merge entries with the same name and append new ones.
//!
//! Finalisation runs once after all sources are merged: derived defaults,
//! environment overrides, and the deprecated join field normalisation.

use std::fmt;
use std::path::Path;

use crate::config::schema::*;
use crate::config::sources::{
    Environment, RawConfigSource, ENV_LICENSE, ENV_LICENSE_PATH, ENV_VAULT_NAMESPACE,
};

/// Overlay `other` onto `self`, keeping every field `other` leaves unset.
pub trait Merge {
    fn merge(&mut self, other: Self);
}

fn set<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

fn replace<T>(dst: &mut Vec<T>, src: Vec<T>) {
    if !src.is_empty() {
        *dst = src;
    }
}

trait Named {
    fn name(&self) -> &str;
}

fn merge_named<T: Merge + Named>(dst: &mut Vec<T>, src: Vec<T>) {
    for item in src {
        match dst.iter_mut().find(|existing| existing.name() == item.name()) {
            Some(existing) => existing.merge(item),
            None => dst.push(item),
        }
    }
}

impl Merge for AgentConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.region, other.region);
        set(&mut self.datacenter, other.datacenter);
        set(&mut self.name, other.name);
        set(&mut self.data_dir, other.data_dir);
        set(&mut self.plugin_dir, other.plugin_dir);
        set(&mut self.bind_addr, other.bind_addr);
        set(&mut self.log_level, other.log_level);
        set(&mut self.log_json, other.log_json);
        set(&mut self.leave_on_interrupt, other.leave_on_interrupt);
        set(&mut self.leave_on_terminate, other.leave_on_terminate);
        set(&mut self.disable_update_check, other.disable_update_check);
        set(
            &mut self.disable_anonymous_signature,
            other.disable_anonymous_signature,
        );
        set(&mut self.dev_mode, other.dev_mode);
        self.ports.merge(other.ports);
        self.addresses.merge(other.addresses);
        self.advertise.merge(other.advertise);
        self.server.merge(other.server);
        self.client.merge(other.client);
        self.tls.merge(other.tls);
        self.telemetry.merge(other.telemetry);
        self.rpc.merge(other.rpc);
        self.acl.merge(other.acl);
        merge_named(&mut self.consuls, other.consuls);
        merge_named(&mut self.vaults, other.vaults);
        self.files.extend(other.files);
    }
}

impl Merge for Ports {
    fn merge(&mut self, other: Self) {
        set(&mut self.http, other.http);
        set(&mut self.rpc, other.rpc);
        set(&mut self.serf, other.serf);
    }
}

impl Merge for Addresses {
    fn merge(&mut self, other: Self) {
        set(&mut self.http, other.http);
        set(&mut self.rpc, other.rpc);
        set(&mut self.serf, other.serf);
    }
}

impl Merge for ServerConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.enabled, other.enabled);
        set(&mut self.bootstrap_expect, other.bootstrap_expect);
        set(&mut self.encrypt_key, other.encrypt_key);
        set(&mut self.raft_protocol, other.raft_protocol);
        set(&mut self.protocol_version, other.protocol_version);
        set(&mut self.rejoin_after_leave, other.rejoin_after_leave);
        set(&mut self.oidc_issuer, other.oidc_issuer);
        set(&mut self.license_path, other.license_path);
        set(&mut self.license_env, other.license_env);
        replace(&mut self.start_join, other.start_join);
        replace(&mut self.retry_join, other.retry_join);
        set(&mut self.retry_max_attempts, other.retry_max_attempts);
        set(&mut self.retry_interval, other.retry_interval);
        self.server_join.merge(other.server_join);
        self.scheduler.merge(other.scheduler);
    }
}

impl Merge for ServerJoin {
    fn merge(&mut self, other: Self) {
        replace(&mut self.start_join, other.start_join);
        replace(&mut self.retry_join, other.retry_join);
        set(&mut self.retry_max_attempts, other.retry_max_attempts);
        set(&mut self.retry_interval, other.retry_interval);
    }
}

impl Merge for SchedulerConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.scheduler_algorithm, other.scheduler_algorithm);
        set(
            &mut self.memory_oversubscription_enabled,
            other.memory_oversubscription_enabled,
        );
        set(&mut self.reject_job_registration, other.reject_job_registration);
        set(&mut self.pause_eval_broker, other.pause_eval_broker);
    }
}

impl Merge for ClientConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.enabled, other.enabled);
        set(&mut self.state_dir, other.state_dir);
        set(&mut self.alloc_dir, other.alloc_dir);
        set(&mut self.alloc_mounts_dir, other.alloc_mounts_dir);
        set(&mut self.host_volumes_dir, other.host_volumes_dir);
        set(&mut self.host_volume_plugin_dir, other.host_volume_plugin_dir);
        set(&mut self.node_class, other.node_class);
        set(&mut self.node_pool, other.node_pool);
        set(&mut self.network_interface, other.network_interface);
        set(&mut self.network_speed, other.network_speed);
        set(
            &mut self.preferred_address_family,
            other.preferred_address_family,
        );
        replace(&mut self.servers, other.servers);
        self.meta.extend(other.meta);
        self.server_join.merge(other.server_join);
        set(&mut self.min_dynamic_port, other.min_dynamic_port);
        set(&mut self.max_dynamic_port, other.max_dynamic_port);
        self.reserved.merge(other.reserved);
        merge_named(&mut self.host_networks, other.host_networks);
        merge_named(&mut self.host_volumes, other.host_volumes);
        self.artifact.merge(other.artifact);
        self.drain.merge(other.drain);
    }
}

impl Merge for Reserved {
    fn merge(&mut self, other: Self) {
        set(&mut self.cpu, other.cpu);
        set(&mut self.memory, other.memory);
        set(&mut self.disk, other.disk);
        set(&mut self.reserved_ports, other.reserved_ports);
    }
}

impl Named for HostNetwork {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Merge for HostNetwork {
    fn merge(&mut self, other: Self) {
        set(&mut self.cidr, other.cidr);
        set(&mut self.interface, other.interface);
        set(&mut self.reserved_ports, other.reserved_ports);
    }
}

impl Named for HostVolume {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Merge for HostVolume {
    fn merge(&mut self, other: Self) {
        set(&mut self.path, other.path);
        set(&mut self.read_only, other.read_only);
    }
}

impl Merge for ArtifactConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.http_read_timeout, other.http_read_timeout);
        set(&mut self.http_max_size, other.http_max_size);
        set(&mut self.gcs_timeout, other.gcs_timeout);
        set(&mut self.git_timeout, other.git_timeout);
        set(&mut self.hg_timeout, other.hg_timeout);
        set(&mut self.s3_timeout, other.s3_timeout);
        set(
            &mut self.decompression_file_count_limit,
            other.decompression_file_count_limit,
        );
        set(
            &mut self.decompression_size_limit,
            other.decompression_size_limit,
        );
        set(
            &mut self.disable_filesystem_isolation,
            other.disable_filesystem_isolation,
        );
    }
}

impl Merge for DrainConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.deadline, other.deadline);
        set(&mut self.ignore_system_jobs, other.ignore_system_jobs);
        set(&mut self.force, other.force);
    }
}

impl Merge for TlsConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.enable_http, other.enable_http);
        set(&mut self.enable_rpc, other.enable_rpc);
        set(&mut self.ca_file, other.ca_file);
        set(&mut self.cert_file, other.cert_file);
        set(&mut self.key_file, other.key_file);
        set(&mut self.verify_server_hostname, other.verify_server_hostname);
        set(&mut self.verify_https_client, other.verify_https_client);
    }
}

impl Merge for TelemetryConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.collection_interval, other.collection_interval);
        set(
            &mut self.in_memory_retention_period,
            other.in_memory_retention_period,
        );
        set(&mut self.disable_hostname, other.disable_hostname);
        set(&mut self.use_node_name, other.use_node_name);
        replace(&mut self.prefix_filter, other.prefix_filter);
        set(&mut self.filter_default, other.filter_default);
        set(&mut self.statsite_address, other.statsite_address);
        set(&mut self.statsd_address, other.statsd_address);
        set(&mut self.datadog_address, other.datadog_address);
        replace(&mut self.datadog_tags, other.datadog_tags);
        set(&mut self.prometheus_metrics, other.prometheus_metrics);
        set(&mut self.circonus_api_token, other.circonus_api_token);
        set(&mut self.circonus_api_app, other.circonus_api_app);
        set(&mut self.circonus_api_url, other.circonus_api_url);
        set(
            &mut self.circonus_submission_interval,
            other.circonus_submission_interval,
        );
        set(
            &mut self.circonus_submission_url,
            other.circonus_submission_url,
        );
        set(&mut self.circonus_check_id, other.circonus_check_id);
        set(
            &mut self.circonus_check_display_name,
            other.circonus_check_display_name,
        );
        set(
            &mut self.circonus_check_search_tag,
            other.circonus_check_search_tag,
        );
        set(&mut self.circonus_broker_id, other.circonus_broker_id);
    }
}

impl Merge for RpcConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.accept_backlog, other.accept_backlog);
        set(&mut self.keep_alive_interval, other.keep_alive_interval);
        set(
            &mut self.connection_write_timeout,
            other.connection_write_timeout,
        );
        set(&mut self.max_stream_window_size, other.max_stream_window_size);
        set(&mut self.stream_open_timeout, other.stream_open_timeout);
        set(&mut self.stream_close_timeout, other.stream_close_timeout);
    }
}

impl Merge for AclConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.enabled, other.enabled);
        set(&mut self.replication_token, other.replication_token);
    }
}

impl Named for ConsulConfig {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Merge for ConsulConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.address, other.address);
        set(&mut self.token, other.token);
        set(&mut self.auth, other.auth);
        set(&mut self.ssl, other.ssl);
        set(&mut self.verify_ssl, other.verify_ssl);
        set(&mut self.server_auto_join, other.server_auto_join);
        set(&mut self.client_auto_join, other.client_auto_join);
    }
}

impl Named for VaultConfig {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Merge for VaultConfig {
    fn merge(&mut self, other: Self) {
        set(&mut self.enabled, other.enabled);
        set(&mut self.address, other.address);
        set(&mut self.namespace, other.namespace);
        set(&mut self.role, other.role);
        set(&mut self.tls_skip_verify, other.tls_skip_verify);
    }
}

/// Merge ordered sources into one raw configuration tree.
pub fn assemble<I>(sources: I) -> AgentConfig
where
    I: IntoIterator<Item = RawConfigSource>,
{
    sources
        .into_iter()
        .fold(AgentConfig::default(), |mut acc, source| {
            acc.merge(source.into_config());
            acc
        })
}

/// A deprecated field that was folded into its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprecationNotice {
    pub field: &'static str,
    pub replacement: &'static str,
}

impl fmt::Display for DeprecationNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "using deprecated {} field; upgrade configuration to use {}",
            self.field, self.replacement
        )
    }
}

/// Output of [`finalize`].
#[derive(Debug, Clone)]
pub struct Assembled {
    pub config: AgentConfig,
    pub notices: Vec<DeprecationNotice>,
}

/// Apply derived defaults, environment overrides and join normalisation.
pub fn finalize(mut config: AgentConfig, env: &dyn Environment) -> Assembled {
    if config.plugin_dir.is_none() {
        if let Some(data_dir) = &config.data_dir {
            config.plugin_dir = Some(Path::new(data_dir).join("plugins").display().to_string());
        }
    }

    if config.server.scheduler.scheduler_algorithm.is_none() {
        config.server.scheduler.scheduler_algorithm = Some("binpack".to_string());
    }

    apply_environment(&mut config, env);

    let (config, notices) = normalize_join(config);
    Assembled { config, notices }
}

/// Last-mile overrides read after every source has been merged.
fn apply_environment(config: &mut AgentConfig, env: &dyn Environment) {
    if let Some(namespace) = env.var(ENV_VAULT_NAMESPACE) {
        if let Some(vault) = config
            .vaults
            .iter_mut()
            .find(|v| v.name == DEFAULT_CLUSTER && v.namespace.is_none())
        {
            vault.namespace = Some(namespace);
        }
    }

    config.server.license_env = env.var(ENV_LICENSE);
    if config.server.license_path.is_none() {
        config.server.license_path = env.var(ENV_LICENSE_PATH);
    }
}

/// Fold the deprecated flat join fields into `server.server_join`.
///
/// Nothing moves when the structured block is already populated; validation
/// reports that combination. Running this twice yields the same result.
pub fn normalize_join(mut config: AgentConfig) -> (AgentConfig, Vec<DeprecationNotice>) {
    let mut notices = Vec::new();
    let server = &mut config.server;
    if !server.has_legacy_join() || !server.server_join.is_empty() {
        return (config, notices);
    }

    if !server.start_join.is_empty() {
        server.server_join.start_join = std::mem::take(&mut server.start_join);
        notices.push(DeprecationNotice {
            field: "server.start_join",
            replacement: "server.server_join.start_join",
        });
    }
    if !server.retry_join.is_empty() {
        server.server_join.retry_join = std::mem::take(&mut server.retry_join);
        notices.push(DeprecationNotice {
            field: "server.retry_join",
            replacement: "server.server_join.retry_join",
        });
    }
    if let Some(max) = server.retry_max_attempts.take() {
        server.server_join.retry_max_attempts = Some(max);
        notices.push(DeprecationNotice {
            field: "server.retry_max",
            replacement: "server.server_join.retry_max",
        });
    }
    if let Some(interval) = server.retry_interval.take() {
        server.server_join.retry_interval = Some(interval);
        notices.push(DeprecationNotice {
            field: "server.retry_interval",
            replacement: "server.server_join.retry_interval",
        });
    }

    (config, notices)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::config::sources::default_config;

    fn file(config: AgentConfig) -> RawConfigSource {
        RawConfigSource::File {
            path: PathBuf::from("test.toml"),
            config,
        }
    }

    #[test]
    fn later_sources_win_and_unset_fields_survive() {
        let mut a = AgentConfig::default();
        a.region = Some("a".into());
        a.datacenter = Some("dc-a".into());
        a.server.bootstrap_expect = Some(3);
        a.client.meta.insert("k1".into(), "a".into());

        let mut b = AgentConfig::default();
        b.region = Some("b".into());
        b.server.enabled = Some(true);
        b.client.meta.insert("k2".into(), "b".into());

        let merged = assemble([file(a), RawConfigSource::Cli(b)]);
        assert_eq!(merged.region.as_deref(), Some("b"));
        assert_eq!(merged.datacenter.as_deref(), Some("dc-a"));
        assert_eq!(merged.server.bootstrap_expect, Some(3));
        assert_eq!(merged.server.enabled, Some(true));
        assert_eq!(merged.client.meta.len(), 2);
    }

    #[test]
    fn lists_replace_instead_of_appending() {
        let mut a = AgentConfig::default();
        a.client.servers = vec!["a:4647".into(), "b:4647".into()];
        let mut b = AgentConfig::default();
        b.client.servers = vec!["c:4647".into()];

        let merged = assemble([file(a.clone()), RawConfigSource::Cli(b)]);
        assert_eq!(merged.client.servers, vec!["c:4647"]);

        let merged = assemble([file(a), RawConfigSource::Cli(AgentConfig::default())]);
        assert_eq!(merged.client.servers.len(), 2);
    }

    #[test]
    fn named_blocks_merge_by_name() {
        let base = default_config();
        let mut overlay = AgentConfig::default();
        overlay.consuls.push(ConsulConfig {
            address: Some("10.0.0.5:8500".into()),
            ..ConsulConfig::default()
        });
        overlay.consuls.push(ConsulConfig {
            name: "infra".into(),
            ..ConsulConfig::default()
        });

        let merged = assemble([RawConfigSource::Enterprise(base), file(overlay)]);
        assert_eq!(merged.consuls.len(), 2);
        assert_eq!(
            merged.default_consul().and_then(|c| c.address.as_deref()),
            Some("10.0.0.5:8500")
        );
    }

    #[test]
    fn files_accumulate_in_order() {
        let merged = assemble([
            RawConfigSource::Defaults,
            RawConfigSource::File {
                path: PathBuf::from("one.toml"),
                config: AgentConfig::default(),
            },
            RawConfigSource::File {
                path: PathBuf::from("two.toml"),
                config: AgentConfig::default(),
            },
        ]);
        assert_eq!(merged.files, vec!["one.toml", "two.toml"]);
    }

    #[test]
    fn plugin_dir_defaults_under_data_dir() {
        let mut config = default_config();
        config.data_dir = Some("/var/lib/agent".into());
        let assembled = finalize(config, &HashMap::<String, String>::new());
        assert_eq!(
            assembled.config.plugin_dir.as_deref(),
            Some("/var/lib/agent/plugins")
        );
    }

    #[test]
    fn environment_overrides_only_fill_gaps() {
        let env: HashMap<String, String> = [
            (ENV_VAULT_NAMESPACE.to_string(), "ops".to_string()),
            (ENV_LICENSE.to_string(), "license-body".to_string()),
            (ENV_LICENSE_PATH.to_string(), "/env/license".to_string()),
        ]
        .into();

        let mut config = default_config();
        config.server.license_path = Some("/etc/license".into());
        let assembled = finalize(config, &env);

        assert_eq!(
            assembled
                .config
                .default_vault()
                .and_then(|v| v.namespace.as_deref()),
            Some("ops")
        );
        assert_eq!(
            assembled.config.server.license_env.as_deref(),
            Some("license-body")
        );
        assert_eq!(
            assembled.config.server.license_path.as_deref(),
            Some("/etc/license")
        );
    }

    #[test]
    fn legacy_join_fields_fold_once() {
        let mut config = default_config();
        config.server.retry_join = vec!["10.0.0.1".into()];
        config.server.retry_max_attempts = Some(4);
        config.server.retry_interval = Some(Duration::from_secs(5));

        let (config, notices) = normalize_join(config);
        assert_eq!(notices.len(), 3);
        assert_eq!(config.server.server_join.retry_join, vec!["10.0.0.1"]);
        assert_eq!(config.server.server_join.retry_max_attempts, Some(4));
        assert!(!config.server.has_legacy_join());

        let (again, notices) = normalize_join(config.clone());
        assert!(notices.is_empty());
        assert_eq!(again, config);
    }

    #[test]
    fn conflicting_join_blocks_are_left_for_validation() {
        let mut config = default_config();
        config.server.retry_join = vec!["10.0.0.1".into()];
        config.server.server_join.retry_join = vec!["10.0.0.2".into()];

        let (config, notices) = normalize_join(config);
        assert!(notices.is_empty());
        assert_eq!(config.server.retry_join, vec!["10.0.0.1"]);
        assert_eq!(config.server.server_join.retry_join, vec!["10.0.0.2"]);
    }
}
