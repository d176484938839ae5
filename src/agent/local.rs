//! In-process agent used by the binary.
//!
//! The scheduler and task runner live elsewhere; this agent owns node
//! identity and configuration snapshots, serves the HTTP endpoints, and joins
//! by probing peers over TCP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tokio::net::TcpStream;

use crate::agent::{Agent, AgentError, Listeners, ReloadError, Subsystem, SubsystemFactory};
use crate::config::sources::{DEFAULT_RPC_PORT, DEFAULT_SERF_PORT};
use crate::config::EffectiveConfig;
use crate::join::{JoinError, Role};
use crate::net::listener::{router, HttpListeners, ListenerState};
use crate::net::tls::load_tls_config;
use crate::net::TlsMaterial;
use crate::observability::telemetry::TelemetryHandles;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One role backed by a swappable configuration snapshot.
pub struct LocalSubsystem {
    role: Role,
    config: ArcSwap<EffectiveConfig>,
}

impl LocalSubsystem {
    fn new(role: Role, config: &EffectiveConfig) -> Self {
        Self {
            role,
            config: ArcSwap::from_pointee(config.clone()),
        }
    }

    pub fn config(&self) -> Arc<EffectiveConfig> {
        self.config.load_full()
    }

    fn default_port(&self) -> u16 {
        match self.role {
            Role::Server => DEFAULT_SERF_PORT,
            Role::Client => DEFAULT_RPC_PORT,
        }
    }
}

impl Subsystem for LocalSubsystem {
    fn role(&self) -> Role {
        self.role
    }

    fn reload(&self, config: &EffectiveConfig) -> Result<(), ReloadError> {
        let enabled = match self.role {
            Role::Server => config.server.is_enabled(),
            Role::Client => config.client.is_enabled(),
        };
        if !enabled {
            return Err(ReloadError::Convert {
                component: self.role.as_str(),
                reason: "a role cannot be disabled by reload".to_string(),
            });
        }
        self.config.store(Arc::new(config.clone()));
        Ok(())
    }

    fn join(&self, addrs: Vec<String>) -> BoxFuture<'static, Result<usize, JoinError>> {
        let default_port = self.default_port();
        let role = self.role;
        async move {
            let probes = addrs.iter().map(|addr| probe(with_port(addr, default_port)));
            let results = future::join_all(probes).await;

            let mut joined = 0;
            let mut last_err = None;
            for result in results {
                match result {
                    Ok(()) => joined += 1,
                    Err(e) => last_err = Some(e),
                }
            }
            match (joined, last_err) {
                (0, Some(e)) => Err(e),
                (0, None) => Err(JoinError::NoAddresses),
                (n, _) => {
                    tracing::debug!(agent_mode = %role, peers = n, "Probed peers");
                    Ok(n)
                }
            }
        }
        .boxed()
    }
}

fn with_port(addr: &str, default_port: u16) -> String {
    let has_port = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && !host.ends_with(':') && port.parse::<u16>().is_ok());
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, default_port)
    }
}

async fn probe(address: String) -> Result<(), JoinError> {
    let unreachable = |reason: String| JoinError::Unreachable {
        address: address.clone(),
        reason,
    };
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(address.as_str())).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(unreachable(e.to_string())),
        Err(_) => Err(unreachable("timed out".to_string())),
    }
}

/// The binary's agent.
pub struct LocalAgent {
    node_id: String,
    config: ArcSwap<EffectiveConfig>,
    server: Option<Arc<LocalSubsystem>>,
    client: Option<Arc<LocalSubsystem>>,
}

impl LocalAgent {
    pub fn new(config: &EffectiveConfig) -> Self {
        let node_id = uuid::Uuid::new_v4().to_string();
        let server = config
            .server
            .is_enabled()
            .then(|| Arc::new(LocalSubsystem::new(Role::Server, config)));
        let client = config
            .client
            .is_enabled()
            .then(|| Arc::new(LocalSubsystem::new(Role::Client, config)));
        Self {
            node_id,
            config: ArcSwap::from_pointee(config.clone()),
            server,
            client,
        }
    }

    pub fn config(&self) -> Arc<EffectiveConfig> {
        self.config.load_full()
    }
}

impl Agent for LocalAgent {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn server(&self) -> Option<Arc<dyn Subsystem>> {
        self.server.clone().map(|s| s as Arc<dyn Subsystem>)
    }

    fn client(&self) -> Option<Arc<dyn Subsystem>> {
        self.client.clone().map(|c| c as Arc<dyn Subsystem>)
    }

    fn reload(&self, config: &EffectiveConfig) -> Result<(), ReloadError> {
        TlsMaterial::load(&config.tls).map_err(|e| ReloadError::Convert {
            component: "agent",
            reason: e.to_string(),
        })?;
        self.config.store(Arc::new(config.clone()));
        Ok(())
    }

    fn leave(&self) -> BoxFuture<'static, Result<(), AgentError>> {
        let node_id = self.node_id.clone();
        async move {
            tracing::info!(node_id = %node_id, "Left cluster");
            Ok(())
        }
        .boxed()
    }

    fn shutdown(&self) {
        tracing::info!(node_id = %self.node_id, "Agent shut down");
    }
}

/// Starts [`LocalAgent`] and its HTTP listeners.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFactory;

impl SubsystemFactory for LocalFactory {
    fn start_agent(
        &self,
        config: &EffectiveConfig,
        _telemetry: &TelemetryHandles,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        TlsMaterial::load(&config.tls)?;
        Ok(Arc::new(LocalAgent::new(config)))
    }

    fn start_listeners(
        &self,
        agent: Arc<dyn Agent>,
        config: &EffectiveConfig,
        telemetry: &TelemetryHandles,
    ) -> BoxFuture<'static, Result<Box<dyn Listeners>, AgentError>> {
        let config = config.clone();
        let telemetry = telemetry.clone();
        async move {
            let addr = config
                .http_addr()
                .map_err(crate::net::ListenerError::from)?;

            let tls = match (
                config.tls.http_enabled(),
                config.tls.cert_file.as_deref(),
                config.tls.key_file.as_deref(),
            ) {
                (true, Some(cert), Some(key)) => Some(
                    load_tls_config(Path::new(cert), Path::new(key))
                        .await
                        .map_err(crate::net::ListenerError::Tls)?,
                ),
                _ => None,
            };

            let app = router(ListenerState {
                agent,
                config,
                telemetry,
            });
            let listeners = HttpListeners::start(addr, tls, app).await?;
            Ok(Box::new(listeners) as Box<dyn Listeners>)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build, RawConfigSource};
    use std::collections::HashMap;

    fn dev() -> EffectiveConfig {
        build([RawConfigSource::DevMode], &HashMap::<String, String>::new()).unwrap().config
    }

    #[test]
    fn default_ports_are_added() {
        assert_eq!(with_port("10.0.0.1", 4648), "10.0.0.1:4648");
        assert_eq!(with_port("10.0.0.1:9999", 4648), "10.0.0.1:9999");
        assert_eq!(with_port("servers.local", 4647), "servers.local:4647");
    }

    #[test]
    fn roles_follow_configuration() {
        let agent = LocalAgent::new(&dev());
        assert!(agent.server().is_some());
        assert!(agent.client().is_some());
        assert_eq!(agent.node_id().len(), 36);
    }

    #[test]
    fn disabling_a_role_on_reload_is_a_convert_error() {
        let config = dev();
        let agent = LocalAgent::new(&config);

        let mut cli = crate::config::AgentConfig::default();
        cli.client.enabled = Some(false);
        let without_client = build(
            [RawConfigSource::DevMode, RawConfigSource::Cli(cli)],
            &HashMap::<String, String>::new(),
        )
        .unwrap()
        .config;

        let client = agent.client().unwrap();
        let err = client.reload(&without_client).unwrap_err();
        assert!(!err.is_fatal());
        assert!(agent.server().unwrap().reload(&without_client).is_ok());
    }

    #[tokio::test]
    async fn join_counts_reachable_peers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let agent = LocalAgent::new(&dev());
        let server = agent.server().unwrap();

        let joined = server.join(vec![addr.to_string()]).await.unwrap();
        assert_eq!(joined, 1);

        drop(listener);
        let err = server.join(vec![addr.to_string()]).await.unwrap_err();
        assert!(matches!(err, JoinError::Unreachable { .. }));
    }
}
