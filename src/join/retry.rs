//! Bounded retry loop around a role's join operation.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::join::{JoinError, JoinFn, JoinSpec, Resolver, Role};

/// How a coordinator finished.
#[derive(Debug)]
pub enum JoinOutcome {
    Joined { attempts: u32, peers: usize },
    /// `max_attempts` reached; the fatal channel has been notified.
    Exhausted {
        attempts: u32,
        last_error: Option<JoinError>,
    },
    Cancelled { attempts: u32 },
}

/// Per-run attempt bookkeeping. Lives only as long as the coordinator task.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<JoinError>,
}

/// Joins one role to the cluster, retrying on failure.
pub struct RetryJoiner {
    spec: JoinSpec,
    resolver: Arc<dyn Resolver>,
    join: JoinFn,
    fatal_tx: mpsc::UnboundedSender<Role>,
    cancel: Option<broadcast::Receiver<()>>,
}

impl RetryJoiner {
    pub fn new(
        spec: JoinSpec,
        resolver: Arc<dyn Resolver>,
        join: JoinFn,
        fatal_tx: mpsc::UnboundedSender<Role>,
    ) -> Self {
        Self {
            spec,
            resolver,
            join,
            fatal_tx,
            cancel: None,
        }
    }

    /// Stop retrying once this receiver fires. Retry behaviour is otherwise
    /// unchanged.
    pub fn with_cancel(mut self, cancel: broadcast::Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Retry until joined, exhausted or cancelled.
    pub async fn run(mut self) -> JoinOutcome {
        let role = self.spec.role;
        let mut state = RetryState::default();
        let mut cancel = self.cancel.take();

        tracing::info!(
            agent_mode = %role,
            targets = ?self.spec.addresses,
            max_attempts = self.spec.max_attempts,
            interval = ?self.spec.retry_interval,
            "Starting retry join"
        );

        loop {
            // An attempt in flight always finishes and counts.
            let result = self.attempt().await;
            metrics::counter!("agent.join.attempts", "role" => role.as_str()).increment(1);

            match result {
                Ok(peers) => {
                    state.attempts += 1;
                    tracing::info!(agent_mode = %role, peers, "Join completed");
                    return JoinOutcome::Joined {
                        attempts: state.attempts,
                        peers,
                    };
                }
                Err(e) => {
                    state.attempts += 1;
                    tracing::warn!(
                        agent_mode = %role,
                        attempt = state.attempts,
                        error = %e,
                        "Join failed"
                    );
                    state.last_error = Some(e);
                }
            }

            let max = self.spec.max_attempts;
            if max > 0 && state.attempts >= max {
                tracing::error!(agent_mode = %role, attempts = state.attempts, "Max join retry exhausted, exiting");
                metrics::counter!("agent.join.exhausted", "role" => role.as_str()).increment(1);
                let _ = self.fatal_tx.send(role);
                return JoinOutcome::Exhausted {
                    attempts: state.attempts,
                    last_error: state.last_error,
                };
            }

            tracing::info!(agent_mode = %role, interval = ?self.spec.retry_interval, "Retrying join");
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    return JoinOutcome::Cancelled { attempts: state.attempts };
                }
                _ = tokio::time::sleep(self.spec.retry_interval) => {}
            }
        }
    }

    async fn attempt(&self) -> Result<usize, JoinError> {
        let addrs = self.resolver.resolve(self.spec.addresses.clone()).await?;
        if addrs.is_empty() {
            return Err(JoinError::NoAddresses);
        }
        (self.join)(addrs).await
    }
}

async fn cancelled(cancel: &mut Option<broadcast::Receiver<()>>) {
    match cancel {
        // Closed counts as cancelled.
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => pending::<()>().await,
    }
}
