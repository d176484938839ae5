//! Lifecycle event sources and the arbitration bus.
//!
//! # Responsibilities
//! - Register OS signal handlers (SIGINT, SIGTERM, SIGHUP, SIGPIPE)
//! - Merge signals, join failures, shutdown requests, service-stop
//!   notifications and config changes into one ordered stream
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Every source is a plain channel so tests inject events directly
//! - Fixed precedence when several sources are ready at once:
//!   join failure, OS signal, shutdown request, service stop, config change
//! - OS handlers are installed only when the controller reaches Running

use std::fmt;
use std::future::pending;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::join::Role;

/// OS signals the agent reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Pipe,
}

impl Signal {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Signal::Interrupt | Signal::Terminate)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Interrupt => "interrupt",
            Signal::Terminate => "terminated",
            Signal::Hangup => "hangup",
            Signal::Pipe => "broken pipe",
        })
    }
}

/// One input to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    JoinFailed(Role),
    Signal(Signal),
    ShutdownRequested,
    ServiceStop,
    ConfigChanged,
}

/// Where OS signals come from.
#[derive(Debug, Default)]
pub enum SignalSource {
    /// Install process signal handlers when armed.
    Os,
    /// Pre-built channel, used by tests and embedders.
    Injected(mpsc::UnboundedReceiver<Signal>),
    #[default]
    Disabled,
}

/// Event channels handed to the controller.
#[derive(Debug, Default)]
pub struct EventSources {
    pub signals: SignalSource,
    pub shutdown_requests: Option<mpsc::UnboundedReceiver<()>>,
    pub service_stop: Option<mpsc::UnboundedReceiver<()>>,
    pub config_changes: Option<mpsc::UnboundedReceiver<()>>,
}

impl EventSources {
    /// Process signals only.
    pub fn os() -> Self {
        Self {
            signals: SignalSource::Os,
            ..Self::default()
        }
    }
}

/// Single-consumer multiplexer over every lifecycle input.
pub struct EventBus {
    join_failure_tx: mpsc::UnboundedSender<Role>,
    join_failures: mpsc::UnboundedReceiver<Role>,
    unarmed: SignalSource,
    signals: Option<mpsc::UnboundedReceiver<Signal>>,
    shutdown_requests: Option<mpsc::UnboundedReceiver<()>>,
    service_stop: Option<mpsc::UnboundedReceiver<()>>,
    config_changes: Option<mpsc::UnboundedReceiver<()>>,
}

impl EventBus {
    pub fn new(sources: EventSources) -> Self {
        let (join_failure_tx, join_failures) = mpsc::unbounded_channel();
        Self {
            join_failure_tx,
            join_failures,
            unarmed: sources.signals,
            signals: None,
            shutdown_requests: sources.shutdown_requests,
            service_stop: sources.service_stop,
            config_changes: sources.config_changes,
        }
    }

    /// Sender handed to each retry-join coordinator.
    pub fn join_failure_sender(&self) -> mpsc::UnboundedSender<Role> {
        self.join_failure_tx.clone()
    }

    /// Start delivering OS signals. Idempotent.
    pub fn arm_signals(&mut self) -> std::io::Result<()> {
        match std::mem::take(&mut self.unarmed) {
            SignalSource::Os => self.signals = Some(os_signals()?),
            SignalSource::Injected(rx) => self.signals = Some(rx),
            SignalSource::Disabled => {}
        }
        Ok(())
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> LifecycleEvent {
        tokio::select! {
            biased;
            Some(role) = self.join_failures.recv() => LifecycleEvent::JoinFailed(role),
            Some(sig) = recv(&mut self.signals) => LifecycleEvent::Signal(sig),
            Some(()) = recv(&mut self.shutdown_requests) => LifecycleEvent::ShutdownRequested,
            Some(()) = recv(&mut self.service_stop) => LifecycleEvent::ServiceStop,
            Some(()) = recv(&mut self.config_changes) => LifecycleEvent::ConfigChanged,
        }
    }
}

async fn recv<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// Install process signal handlers and forward them onto a channel.
pub fn os_signals() -> std::io::Result<mpsc::UnboundedReceiver<Signal>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut pipe = signal(SignalKind::pipe())?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = interrupt.recv() => Signal::Interrupt,
                Some(()) = terminate.recv() => Signal::Terminate,
                Some(()) = hangup.recv() => Signal::Hangup,
                Some(()) = pipe.recv() => Signal::Pipe,
                else => break,
            };
            if tx.send(sig).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_failure_wins_over_ready_signal() {
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let mut bus = EventBus::new(EventSources {
            signals: SignalSource::Injected(sig_rx),
            service_stop: Some(stop_rx),
            ..EventSources::default()
        });
        bus.arm_signals().unwrap();

        stop_tx.send(()).unwrap();
        sig_tx.send(Signal::Hangup).unwrap();
        bus.join_failure_sender().send(Role::Client).unwrap();

        assert_eq!(bus.next().await, LifecycleEvent::JoinFailed(Role::Client));
        assert_eq!(bus.next().await, LifecycleEvent::Signal(Signal::Hangup));
        assert_eq!(bus.next().await, LifecycleEvent::ServiceStop);
    }

    #[tokio::test]
    async fn signals_wait_until_armed() {
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let mut bus = EventBus::new(EventSources {
            signals: SignalSource::Injected(sig_rx),
            shutdown_requests: Some(req_rx),
            ..EventSources::default()
        });

        sig_tx.send(Signal::Terminate).unwrap();
        req_tx.send(()).unwrap();
        assert_eq!(bus.next().await, LifecycleEvent::ShutdownRequested);

        bus.arm_signals().unwrap();
        assert_eq!(bus.next().await, LifecycleEvent::Signal(Signal::Terminate));
    }

    #[tokio::test]
    async fn closed_sources_are_skipped() {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel::<()>();
        let mut bus = EventBus::new(EventSources {
            shutdown_requests: Some(req_rx),
            config_changes: Some(change_rx),
            ..EventSources::default()
        });
        drop(req_tx);
        change_tx.send(()).unwrap();
        assert_eq!(bus.next().await, LifecycleEvent::ConfigChanged);
    }
}
