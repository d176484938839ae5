//! Shutdown coordination for the agent.
//!
//! # Responsibilities
//! - Tell background tasks (retry joiners, update check) to stop
//! - Race a cooperative leave against the grace window and new events

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::agent::AgentError;
use crate::lifecycle::signals::{EventBus, LifecycleEvent, Signal};

/// Coordinator for background task cancellation.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// How a graceful leave ended.
#[derive(Debug)]
pub enum LeaveOutcome {
    Left,
    Failed(AgentError),
    TimedOut,
    /// A second shutdown request arrived first.
    Interrupted(LifecycleEvent),
    JoinFailed(crate::join::Role),
}

/// Run `leave` on its own task and wait for it, the grace window, or a
/// superseding event, whichever comes first. The losing leave is aborted.
///
/// Any signal other than a broken pipe forces the exit, a hangup included.
/// Broken pipes and config changes arriving in the window are dropped.
pub async fn leave_gracefully(
    leave: BoxFuture<'static, Result<(), AgentError>>,
    grace: Duration,
    bus: &mut EventBus,
) -> LeaveOutcome {
    let leave = tokio::spawn(leave);
    tokio::pin!(leave);
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            biased;
            event = bus.next() => match event {
                LifecycleEvent::JoinFailed(role) => break LeaveOutcome::JoinFailed(role),
                LifecycleEvent::Signal(Signal::Pipe) | LifecycleEvent::ConfigChanged => {
                    tracing::debug!(event = ?event, "Ignoring event during graceful leave");
                }
                other => break LeaveOutcome::Interrupted(other),
            },
            result = &mut leave => break match result {
                Ok(Ok(())) => LeaveOutcome::Left,
                Ok(Err(e)) => LeaveOutcome::Failed(e),
                Err(e) => LeaveOutcome::Failed(AgentError::Leave(e.to_string())),
            },
            _ = &mut deadline => break LeaveOutcome::TimedOut,
        }
    };

    if !matches!(outcome, LeaveOutcome::Left | LeaveOutcome::Failed(_)) {
        leave.abort();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::signals::{EventSources, SignalSource};
    use futures_util::FutureExt;
    use tokio::sync::mpsc;

    fn bus() -> (mpsc::UnboundedSender<Signal>, EventBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus = EventBus::new(EventSources {
            signals: SignalSource::Injected(rx),
            ..EventSources::default()
        });
        bus.arm_signals().unwrap();
        (tx, bus)
    }

    fn slow_leave(after: Duration) -> BoxFuture<'static, Result<(), AgentError>> {
        async move {
            tokio::time::sleep(after).await;
            Ok(())
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn leave_inside_window_is_clean() {
        let (_tx, mut bus) = bus();
        let outcome = leave_gracefully(slow_leave(Duration::from_secs(1)), Duration::from_secs(5), &mut bus).await;
        assert!(matches!(outcome, LeaveOutcome::Left));
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapses() {
        let (_tx, mut bus) = bus();
        let start = tokio::time::Instant::now();
        let outcome = leave_gracefully(slow_leave(Duration::from_secs(60)), Duration::from_secs(5), &mut bus).await;
        assert!(matches!(outcome, LeaveOutcome::TimedOut));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn second_signal_interrupts_and_pipe_does_not() {
        let (tx, mut bus) = bus();
        tx.send(Signal::Pipe).unwrap();
        tx.send(Signal::Interrupt).unwrap();
        let outcome = leave_gracefully(slow_leave(Duration::from_secs(1)), Duration::from_secs(5), &mut bus).await;
        assert!(matches!(
            outcome,
            LeaveOutcome::Interrupted(LifecycleEvent::Signal(Signal::Interrupt))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_during_leave_forces_exit() {
        let (tx, mut bus) = bus();
        tx.send(Signal::Pipe).unwrap();
        tx.send(Signal::Hangup).unwrap();
        let outcome = leave_gracefully(slow_leave(Duration::from_secs(1)), Duration::from_secs(5), &mut bus).await;
        assert!(matches!(
            outcome,
            LeaveOutcome::Interrupted(LifecycleEvent::Signal(Signal::Hangup))
        ));
    }

    #[test]
    fn trigger_reaches_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 1);
        shutdown.trigger();
        assert!(rx.try_recv().is_ok());
    }
}
