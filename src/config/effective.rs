//! The validated, immutable runtime configuration.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::AgentConfig;
use crate::config::sources::DEFAULT_HTTP_PORT;
use crate::join::{JoinSpec, Role};

/// Base grace period for a leave-on-signal shutdown.
pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between join attempts when none is configured.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// A configuration that passed validation.
///
/// Only [`validate`](crate::config::validation::validate) constructs one.
/// Cloning is cheap; a reload replaces the whole value.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig(Arc<AgentConfig>);

impl EffectiveConfig {
    pub(crate) fn new(config: AgentConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn raw(&self) -> &AgentConfig {
        &self.0
    }

    /// Address the HTTP listener binds to.
    pub fn http_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let host = self
            .addresses
            .http
            .as_deref()
            .or(self.bind_addr.as_deref())
            .unwrap_or("0.0.0.0");
        let ip: IpAddr = host.parse()?;
        Ok(SocketAddr::new(ip, self.ports.http.unwrap_or(DEFAULT_HTTP_PORT)))
    }

    /// How long a graceful leave may run before the process gives up.
    pub fn graceful_timeout(&self) -> Duration {
        let drain = if self.client.is_enabled() {
            self.client.drain.deadline.unwrap_or_default()
        } else {
            Duration::ZERO
        };
        GRACEFUL_TIMEOUT.saturating_add(drain)
    }

    /// Addresses the server joins synchronously at startup.
    pub fn start_join(&self) -> Vec<String> {
        if !self.server.is_enabled() {
            return Vec::new();
        }
        let mut addrs = self.server.start_join.clone();
        addrs.extend(self.server.server_join.start_join.iter().cloned());
        addrs
    }

    /// Background join settings for a role, if that role is enabled and has
    /// retry targets.
    pub fn retry_join_spec(&self, role: Role) -> Option<JoinSpec> {
        let join = match role {
            Role::Server if self.server.is_enabled() => &self.server.server_join,
            Role::Client if self.client.is_enabled() => &self.client.server_join,
            _ => return None,
        };
        if join.retry_join.is_empty() {
            return None;
        }
        Some(JoinSpec {
            role,
            addresses: join.retry_join.clone(),
            max_attempts: join.retry_max_attempts.unwrap_or(0),
            retry_interval: join.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
        })
    }
}

impl Deref for EffectiveConfig {
    type Target = AgentConfig;

    fn deref(&self) -> &AgentConfig {
        &self.0
    }
}
