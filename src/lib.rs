//! Cluster agent library.
//!
//! Turns layered configuration into one validated runtime configuration,
//! starts the agent's roles and listeners, joins the cluster in the
//! background, and arbitrates reload and shutdown until the process exits.

pub mod agent;
pub mod cli;
pub mod config;
pub mod join;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::{AgentConfig, EffectiveConfig};
pub use lifecycle::{ExitStatus, LifecycleController};
