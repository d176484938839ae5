//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Mode selection, naming rules, directory roles, port ranges
//! - Join block exclusivity, checked before any join is attempted
//! - Security and deprecation warnings that never block startup
//!
//! # Design Decisions
//! - Returns all fatal diagnostics, not just the first
//! - Validation is a pure function: AgentConfig → Result<Validated, Diagnostics>
//!   (the one filesystem probe is the keyring check, which only warns)
//! - Diagnostics are produced in a fixed order so identical input yields an
//!   identical diagnostic set

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use url::Url;

use crate::config::effective::EffectiveConfig;
use crate::config::merge::DeprecationNotice;
use crate::config::ports::{parse_port_ranges, MAX_VALID_PORT};
use crate::config::schema::{AgentConfig, ArtifactConfig, RpcConfig, TelemetryConfig};

/// Log levels accepted in `log_level`, compared case-insensitively.
pub const VALID_LOG_LEVELS: [&str; 6] = ["OFF", "TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Node pool every node implicitly belongs to; nodes may not register in it.
pub const NODE_POOL_ALL: &str = "all";

const KEYRING_FILE: &str = "server/serf.keyring";
const MIN_STREAM_WINDOW: u32 = 256 * 1024;

/// Outcome of a rejected validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub fatal: Vec<String>,
    pub warnings: Vec<String>,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration rejected: ")?;
        for (i, err) in self.fatal.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {}

/// An accepted configuration plus everything worth telling the operator.
#[derive(Debug, Clone)]
pub struct Validated {
    pub config: EffectiveConfig,
    pub warnings: Vec<String>,
    pub notices: Vec<DeprecationNotice>,
}

impl Validated {
    pub fn with_notices(mut self, notices: Vec<DeprecationNotice>) -> Self {
        self.notices = notices;
        self
    }
}

/// Accept or reject an assembled configuration.
pub fn validate(config: AgentConfig) -> Result<Validated, Diagnostics> {
    let mut diag = Diagnostics::default();

    check_mode(&config, &mut diag);
    check_names(&config, &mut diag);
    check_log_level(&config, &mut diag);
    if let Err(e) = validate_telemetry(&config.telemetry) {
        diag.fatal.push(format!("telemetry block invalid: {}", e));
    }
    check_tls(&config, &mut diag);
    check_encrypt_key(&config, &mut diag);
    check_directories(&config, &mut diag);
    check_client(&config, &mut diag);
    check_scheduler(&config, &mut diag);
    if let Err(e) = validate_rpc(&config.rpc) {
        diag.fatal.push(format!("rpc block invalid: {}", e));
    }
    if !config.is_dev_mode() {
        check_production_requirements(&config, &mut diag);
    }
    check_join(&config, &mut diag);
    if config.server.protocol_version.is_some_and(|v| v != 0) {
        diag.warnings
            .push("Please remove deprecated protocol_version field from config.".to_string());
    }

    if !diag.fatal.is_empty() {
        return Err(diag);
    }
    Ok(Validated {
        config: EffectiveConfig::new(config),
        warnings: diag.warnings,
        notices: Vec::new(),
    })
}

fn check_mode(config: &AgentConfig, diag: &mut Diagnostics) {
    if !config.server.is_enabled() && !config.client.is_enabled() {
        diag.fatal
            .push("must specify either server, client or dev mode for the agent".to_string());
    }
}

fn check_names(config: &AgentConfig, diag: &mut Diagnostics) {
    if config.region.as_deref().is_some_and(|r| r.contains('\0')) {
        diag.fatal.push("Region contains invalid characters".to_string());
    }
    if config
        .datacenter
        .as_deref()
        .is_some_and(|dc| dc.contains(['\0', '*']))
    {
        diag.fatal
            .push("Datacenter contains invalid characters (null or '*')".to_string());
    }

    for consul in &config.consuls {
        if !is_valid_cluster_name(&consul.name) {
            diag.warnings.push(format!(
                "Invalid Consul configuration: invalid name {:?}, must match {}",
                consul.name, NAME_PATTERN
            ));
        }
    }
    for vault in &config.vaults {
        if !is_valid_cluster_name(&vault.name) {
            diag.warnings.push(format!(
                "Invalid Vault configuration: invalid name {:?}, must match {}",
                vault.name, NAME_PATTERN
            ));
        }
    }
}

pub fn is_valid_log_level(level: &str) -> bool {
    VALID_LOG_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level))
}

/// Swap an invalid log level for `current`. Returns the warning to report
/// when a swap happened.
pub fn keep_log_level(config: &mut AgentConfig, current: &str) -> Option<String> {
    if is_valid_log_level(config.log_level()) {
        return None;
    }
    let warning = format!(
        "Invalid log level: {}. Keeping current log level: {}",
        config.log_level().to_ascii_uppercase(),
        current
    );
    config.log_level = Some(current.to_string());
    Some(warning)
}

fn check_log_level(config: &AgentConfig, diag: &mut Diagnostics) {
    if !is_valid_log_level(config.log_level()) {
        diag.fatal.push(format!(
            "Invalid log level: {}. Valid log levels are: {:?}",
            config.log_level().to_ascii_uppercase(),
            VALID_LOG_LEVELS
        ));
    }
}

fn check_tls(config: &AgentConfig, diag: &mut Diagnostics) {
    if !config.is_dev_mode() && !config.tls.is_complete() {
        diag.warnings
            .push("WARNING: mTLS is not configured - the agent is not secure without mTLS!".to_string());
    }
}

fn check_encrypt_key(config: &AgentConfig, diag: &mut Diagnostics) {
    let Some(key) = config.server.encrypt_key.as_deref().filter(|k| !k.is_empty()) else {
        return;
    };

    match STANDARD.decode(key) {
        Ok(bytes) if matches!(bytes.len(), 16 | 24 | 32) => {}
        Ok(bytes) => diag.fatal.push(format!(
            "Invalid encryption key: key size must be 16, 24 or 32 bytes, got {}",
            bytes.len()
        )),
        Err(e) => diag.fatal.push(format!("Invalid encryption key: {}", e)),
    }

    if let Some(data_dir) = config.data_dir.as_deref() {
        if Path::new(data_dir).join(KEYRING_FILE).exists() {
            diag.warnings
                .push("WARNING: keyring exists but -encrypt given, using keyring".to_string());
        }
    }
}

fn check_directories(config: &AgentConfig, diag: &mut Diagnostics) {
    let dirs = [
        ("data-dir", &config.data_dir),
        ("plugin-dir", &config.plugin_dir),
        ("alloc-dir", &config.client.alloc_dir),
        ("alloc-mounts-dir", &config.client.alloc_mounts_dir),
        ("host-volumes-dir", &config.client.host_volumes_dir),
        ("host-volume-plugin-dir", &config.client.host_volume_plugin_dir),
        ("state-dir", &config.client.state_dir),
    ];

    for (role, dir) in dirs {
        let Some(dir) = dir.as_deref().filter(|d| !d.is_empty()) else {
            continue;
        };
        if !Path::new(dir).is_absolute() {
            diag.fatal.push(format!(
                "{} must be given as an absolute path: got {}",
                role, dir
            ));
        }
    }
}

fn check_client(config: &AgentConfig, diag: &mut Diagnostics) {
    let client = &config.client;

    if client.is_enabled() {
        for key in client.meta.keys() {
            if !is_valid_interp_variable(key) {
                diag.fatal.push(format!("Invalid Client.Meta key: {}", key));
            }
        }
    }

    if let Some(pool) = client.node_pool.as_deref().filter(|p| !p.is_empty()) {
        if !is_valid_cluster_name(pool) {
            diag.fatal.push(format!(
                "Invalid node pool: invalid name {:?}, must match {}",
                pool, NAME_PATTERN
            ));
        } else if pool == NODE_POOL_ALL {
            diag.fatal.push(format!(
                "Invalid node pool: node is not allowed to register in node pool {:?}",
                NODE_POOL_ALL
            ));
        }
    }

    for volume in &client.host_volumes {
        if volume.path.as_deref().unwrap_or_default().is_empty() {
            diag.fatal.push("Missing path in host_volume config".to_string());
        }
    }

    let min = client.min_dynamic_port.unwrap_or_default();
    let max = client.max_dynamic_port.unwrap_or_default();
    if !(0..=MAX_VALID_PORT).contains(&min) {
        diag.fatal
            .push(format!("Invalid dynamic port range: min_dynamic_port={}", min));
    }
    if !(0..=MAX_VALID_PORT).contains(&max) {
        diag.fatal
            .push(format!("Invalid dynamic port range: max_dynamic_port={}", max));
    }
    if min > max {
        diag.fatal.push(format!(
            "Invalid dynamic port range: min_dynamic_port={} and max_dynamic_port={}",
            min, max
        ));
    }

    if let Some(ports) = client.reserved.reserved_ports.as_deref() {
        if let Err(e) = parse_port_ranges(ports) {
            diag.fatal
                .push(format!("reserved.reserved_ports {:?} invalid: {}", ports, e));
        }
    }
    for network in &client.host_networks {
        let ports = network.reserved_ports.as_deref().unwrap_or_default();
        if let Err(e) = parse_port_ranges(ports) {
            diag.fatal.push(format!(
                "host_network[{:?}].reserved_ports {:?} invalid: {}",
                network.name, ports, e
            ));
        }
    }

    if let Err(e) = validate_artifact(&client.artifact) {
        diag.fatal.push(format!("client.artifact block invalid: {}", e));
    }

    match client.preferred_address_family.as_deref() {
        None | Some("") | Some("ipv4") | Some("ipv6") => {}
        Some(other) => diag.fatal.push(format!(
            "Invalid preferred-address-family value: {} (valid values: ipv4, ipv6)",
            other
        )),
    }
}

fn check_scheduler(config: &AgentConfig, diag: &mut Diagnostics) {
    match config.server.scheduler.scheduler_algorithm.as_deref() {
        None | Some("binpack") | Some("spread") => {}
        Some(other) => diag.fatal.push(format!(
            "invalid scheduler algorithm {:?}: must be binpack or spread",
            other
        )),
    }
}

fn check_production_requirements(config: &AgentConfig, diag: &mut Diagnostics) {
    let server = &config.server;
    let client = &config.client;
    let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

    if server.is_enabled() && !has(&config.data_dir) {
        diag.fatal
            .push(r#"Must specify "data_dir" config option or "data-dir" CLI flag"#.to_string());
    }

    if client.is_enabled() && !has(&config.data_dir) {
        let missing = !has(&client.alloc_dir)
            || !has(&client.alloc_mounts_dir)
            || !has(&client.state_dir)
            || !has(&config.plugin_dir);
        if missing {
            diag.fatal.push(
                "Must specify the state, alloc-dir, alloc-mounts-dir and plugin-dir if data-dir is omitted."
                    .to_string(),
            );
        }
    }

    let expect = server.bootstrap_expect.unwrap_or_default();
    if !server.is_enabled() && expect > 0 {
        diag.fatal
            .push("Bootstrap requires server mode to be enabled".to_string());
    }
    if server.is_enabled() && expect == 1 {
        diag.warnings
            .push("WARNING: Bootstrap mode enabled! Potentially unsafe operation.".to_string());
    }
    if server.is_enabled() && expect > 1 && expect % 2 == 0 {
        diag.warnings.push(
            "WARNING: Number of bootstrap servers should ideally be set to an odd number."
                .to_string(),
        );
    }

    if let Some(issuer) = server.oidc_issuer.as_deref().filter(|i| !i.is_empty()) {
        if server.is_enabled() {
            match Url::parse(issuer) {
                Err(e) => diag.fatal.push(format!(
                    r#"Error using server.oidc_issuer = "{}" as a base URL: {}"#,
                    issuer, e
                )),
                Ok(url) if url.scheme() != "https" => diag.warnings.push(format!(
                    r#"server.oidc_issuer = "{}" is not using https. Many OIDC implementations require https."#,
                    issuer
                )),
                Ok(_) => {}
            }
        }
    }
}

fn check_join(config: &AgentConfig, diag: &mut Diagnostics) {
    let server = &config.server;
    let join = &server.server_join;

    if !join.is_empty() {
        let legacy = [
            ("start_join", !server.start_join.is_empty()),
            ("retry_join", !server.retry_join.is_empty()),
            ("retry_max", server.retry_max_attempts.is_some()),
            ("retry_interval", server.retry_interval.is_some()),
        ];
        for (field, set) in legacy {
            if set {
                diag.fatal.push(format!(
                    "server_join and {} cannot both be defined; prefer setting the server_join block",
                    field
                ));
            }
        }
    }

    if !join.start_join.is_empty() && !join.retry_join.is_empty() {
        diag.fatal
            .push("server_join: retry_join and start_join cannot both be defined".to_string());
    }

    if !config.client.server_join.start_join.is_empty() {
        diag.fatal
            .push("client.server_join: start_join is not supported for clients".to_string());
    }
}

/// Checks the telemetry block on its own.
pub fn validate_telemetry(telemetry: &TelemetryConfig) -> Result<(), String> {
    for (field, value) in [
        ("collection_interval", &telemetry.collection_interval),
        ("in_memory_retention_period", &telemetry.in_memory_retention_period),
        ("circonus_submission_interval", &telemetry.circonus_submission_interval),
    ] {
        if let Some(raw) = value.as_deref() {
            let parsed = humantime::parse_duration(raw)
                .map_err(|e| format!("failed to parse {} {:?}: {}", field, raw, e))?;
            if parsed.is_zero() {
                return Err(format!("{} must be > 0", field));
            }
        }
    }

    for filter in &telemetry.prefix_filter {
        let valid = filter.len() > 1 && (filter.starts_with('+') || filter.starts_with('-'));
        if !valid {
            return Err(format!(
                "telemetry prefix_filter {:?} must start with '+' or '-'",
                filter
            ));
        }
    }
    Ok(())
}

fn validate_artifact(artifact: &ArtifactConfig) -> Result<(), String> {
    for (field, value) in [
        ("http_read_timeout", &artifact.http_read_timeout),
        ("gcs_timeout", &artifact.gcs_timeout),
        ("git_timeout", &artifact.git_timeout),
        ("hg_timeout", &artifact.hg_timeout),
        ("s3_timeout", &artifact.s3_timeout),
    ] {
        if let Some(raw) = value.as_deref() {
            humantime::parse_duration(raw)
                .map_err(|e| format!("{} not a valid duration: {}", field, e))?;
        }
    }

    for (field, value) in [
        ("http_max_size", &artifact.http_max_size),
        ("decompression_size_limit", &artifact.decompression_size_limit),
    ] {
        if let Some(raw) = value.as_deref() {
            parse_bytes(raw).ok_or_else(|| format!("{} not a valid size: {:?}", field, raw))?;
        }
    }

    if artifact.decompression_file_count_limit.is_some_and(|n| n < 0) {
        return Err("decompression_file_count_limit must be >= 0".to_string());
    }
    Ok(())
}

fn validate_rpc(rpc: &RpcConfig) -> Result<(), String> {
    if rpc.accept_backlog.is_some_and(|b| b <= 0) {
        return Err("accept_backlog must be > 0".to_string());
    }
    for (field, value) in [
        ("keep_alive_interval", rpc.keep_alive_interval),
        ("connection_write_timeout", rpc.connection_write_timeout),
        ("stream_open_timeout", rpc.stream_open_timeout),
        ("stream_close_timeout", rpc.stream_close_timeout),
    ] {
        if value.is_some_and(|d| d.is_zero()) {
            return Err(format!("{} must be > 0", field));
        }
    }
    if rpc.max_stream_window_size.is_some_and(|w| w < MIN_STREAM_WINDOW) {
        return Err(format!("max_stream_window_size must be >= {}", MIN_STREAM_WINDOW));
    }
    Ok(())
}

/// Parses sizes such as `"100MB"`, `"2 GiB"` or `"512"` into bytes.
fn parse_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "kib" => 1 << 10,
        "mb" | "m" => 1_000_000,
        "mib" => 1 << 20,
        "gb" | "g" => 1_000_000_000,
        "gib" => 1 << 30,
        "tb" | "t" => 1_000_000_000_000,
        "tib" => 1 << 40,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

const NAME_PATTERN: &str = "^[a-zA-Z0-9_-]{1,128}$";

fn is_valid_cluster_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Keys usable inside `${meta.<key>}` interpolation.
fn is_valid_interp_variable(key: &str) -> bool {
    !key.is_empty() && !key.contains(['$', '{', '}'])
}
