//! Startup orchestration.
//!
//! # Responsibilities
//! - Build and install telemetry from the validated configuration
//! - Start the agent, then its listeners
//! - Join start_join peers synchronously (servers only)
//! - Launch the background retry joiners once roles are serving
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Anything started before a failure is shut down before returning

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::{join_fn, Agent, AgentError, Listeners, SubsystemFactory};
use crate::config::EffectiveConfig;
use crate::join::{JoinError, JoinOutcome, Resolver, RetryJoiner, Role};
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::telemetry::{self, system_hostname, TelemetryError, TelemetryHandles};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("error initializing telemetry: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("error starting agent: {0}")]
    Agent(#[from] AgentError),

    #[error("error joining cluster: {0}")]
    Join(#[from] JoinError),

    #[error("error installing signal handlers: {0}")]
    Signals(std::io::Error),
}

/// Everything a running agent owns.
pub struct Started {
    pub agent: Arc<dyn Agent>,
    pub listeners: Box<dyn Listeners>,
    pub telemetry: TelemetryHandles,
}

impl Started {
    pub fn stop(&self) {
        self.listeners.shutdown();
        self.agent.shutdown();
    }
}

/// Hostname used for the `host` metric label.
pub fn metrics_hostname(config: &EffectiveConfig) -> String {
    match (&config.name, config.telemetry.use_node_name.unwrap_or(false)) {
        (Some(name), true) => name.clone(),
        _ => system_hostname(),
    }
}

/// Bring the agent up in dependency order.
pub async fn start<F: SubsystemFactory>(
    config: &EffectiveConfig,
    factory: &F,
) -> Result<Started, StartupError> {
    let telemetry = telemetry::build_sinks(&config.telemetry, &metrics_hostname(config))?.install();

    let agent = factory.start_agent(config, &telemetry)?;

    let listeners = match factory
        .start_listeners(agent.clone(), config, &telemetry)
        .await
    {
        Ok(listeners) => listeners,
        Err(e) => {
            agent.shutdown();
            return Err(e.into());
        }
    };

    let started = Started {
        agent,
        listeners,
        telemetry,
    };

    let start_join = config.start_join();
    if !start_join.is_empty() {
        if let Some(server) = started.agent.server() {
            match server.join(start_join).await {
                Ok(peers) => tracing::info!(peers, "Joined cluster at startup"),
                Err(e) => {
                    started.stop();
                    return Err(e.into());
                }
            }
        }
    }

    log_synopsis(config, &started);
    Ok(started)
}

fn log_synopsis(config: &EffectiveConfig, started: &Started) {
    let addrs: Vec<String> = started
        .listeners
        .addrs()
        .iter()
        .map(ToString::to_string)
        .collect();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %started.agent.node_id(),
        region = config.region.as_deref().unwrap_or_default(),
        datacenter = config.datacenter.as_deref().unwrap_or_default(),
        server = config.server.is_enabled(),
        client = config.client.is_enabled(),
        log_level = config.log_level(),
        bind_addr = config.bind_addr.as_deref().unwrap_or_default(),
        advertise_http = config.advertise.http.as_deref().unwrap_or_default(),
        http = ?addrs,
        sinks = ?started.telemetry.sinks,
        "Agent configuration"
    );
}

/// Start one retry coordinator per enabled role with retry targets.
pub fn launch_joiners(
    config: &EffectiveConfig,
    agent: &dyn Agent,
    resolver: Arc<dyn Resolver>,
    fatal_tx: mpsc::UnboundedSender<Role>,
    shutdown: &Shutdown,
) -> Vec<JoinHandle<JoinOutcome>> {
    let mut handles = Vec::new();
    for role in [Role::Server, Role::Client] {
        let Some(spec) = config.retry_join_spec(role) else {
            continue;
        };
        let subsystem = match role {
            Role::Server => agent.server(),
            Role::Client => agent.client(),
        };
        let Some(subsystem) = subsystem else {
            continue;
        };

        let joiner = RetryJoiner::new(spec, resolver.clone(), join_fn(subsystem), fatal_tx.clone())
            .with_cancel(shutdown.subscribe());
        handles.push(tokio::spawn(joiner.run()));
    }
    handles
}
