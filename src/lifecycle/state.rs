//! Lifecycle states and process exit status.

use std::fmt;
use std::process::ExitCode;

/// Where the controller is in the agent's life.
///
/// Only the controller writes this. Observers get a read-only watch receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Reloading,
    GracefulShutdown,
    ForcedShutdown,
    Terminated(ExitStatus),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated(_))
    }

    /// Stable number for the `agent.state` gauge.
    pub fn ordinal(&self) -> u8 {
        match self {
            LifecycleState::Starting => 0,
            LifecycleState::Running => 1,
            LifecycleState::Reloading => 2,
            LifecycleState::GracefulShutdown => 3,
            LifecycleState::ForcedShutdown => 4,
            LifecycleState::Terminated(_) => 5,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Starting => f.write_str("starting"),
            LifecycleState::Running => f.write_str("running"),
            LifecycleState::Reloading => f.write_str("reloading"),
            LifecycleState::GracefulShutdown => f.write_str("graceful-shutdown"),
            LifecycleState::ForcedShutdown => f.write_str("forced-shutdown"),
            LifecycleState::Terminated(status) => write!(f, "terminated({})", status.code()),
        }
    }
}

/// Process outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Failure => 1,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}
