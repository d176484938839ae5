//! Agent collaborator seams.
//!
//! # Responsibilities
//! - Define what the lifecycle controller needs from a running agent
//! - Separate the server and client subsystems so each reloads independently
//! - Provide the in-process implementation used by the binary (`local.rs`)
//!
//! # Design Decisions
//! - Async operations return `BoxFuture` so the traits stay object safe
//! - A reload error says whether the process can survive it
//! - Subsystem handles are owned by the controller and replaced wholesale

pub mod local;

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::config::EffectiveConfig;
use crate::join::{JoinError, JoinFn, Role};
use crate::net::{ListenerError, TlsError};
use crate::observability::telemetry::TelemetryHandles;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to start agent: {0}")]
    Start(String),

    #[error("failed to start listeners: {0}")]
    Listener(#[from] ListenerError),

    #[error("failed to load TLS material: {0}")]
    Tls(#[from] TlsError),

    #[error("error leaving cluster: {0}")]
    Leave(String),
}

/// Failure while applying a reloaded configuration to one component.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The new configuration could not be turned into component settings.
    /// The component keeps its previous configuration.
    #[error("failed to convert {component} config: {reason}")]
    Convert {
        component: &'static str,
        reason: String,
    },

    /// The component accepted the new configuration but could not apply it.
    #[error("failed to reload {component}: {reason}")]
    Apply {
        component: &'static str,
        reason: String,
    },
}

impl ReloadError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReloadError::Apply { .. })
    }
}

/// One role's running subsystem.
pub trait Subsystem: Send + Sync {
    fn role(&self) -> Role;

    fn reload(&self, config: &EffectiveConfig) -> Result<(), ReloadError>;

    /// Server: gossip join. Client: replace the known server list.
    fn join(&self, addrs: Vec<String>) -> BoxFuture<'static, Result<usize, JoinError>>;
}

/// A running agent.
pub trait Agent: Send + Sync {
    fn node_id(&self) -> &str;

    fn server(&self) -> Option<Arc<dyn Subsystem>>;

    fn client(&self) -> Option<Arc<dyn Subsystem>>;

    /// Agent-level settings such as TLS. Subsystems reload separately.
    fn reload(&self, config: &EffectiveConfig) -> Result<(), ReloadError>;

    /// Cooperatively leave the cluster.
    fn leave(&self) -> BoxFuture<'static, Result<(), AgentError>>;

    fn shutdown(&self);
}

/// A running set of network listeners.
pub trait Listeners: Send + Sync {
    fn addrs(&self) -> Vec<SocketAddr>;

    fn shutdown(&self);
}

/// Constructs the agent and its listeners.
pub trait SubsystemFactory: Send + Sync {
    fn start_agent(
        &self,
        config: &EffectiveConfig,
        telemetry: &TelemetryHandles,
    ) -> Result<Arc<dyn Agent>, AgentError>;

    fn start_listeners(
        &self,
        agent: Arc<dyn Agent>,
        config: &EffectiveConfig,
        telemetry: &TelemetryHandles,
    ) -> BoxFuture<'static, Result<Box<dyn Listeners>, AgentError>>;
}

/// Adapt a subsystem's join into the retry coordinator's join function.
pub fn join_fn(subsystem: Arc<dyn Subsystem>) -> JoinFn {
    Arc::new(move |addrs| subsystem.join(addrs))
}
