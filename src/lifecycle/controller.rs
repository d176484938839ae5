//! The lifecycle state machine.
//!
//! # Responsibilities
//! - Own the current configuration and every running subsystem handle
//! - Process lifecycle events strictly one at a time
//! - Reload synchronously, shut down within a bounded time
//!
//! # Data Flow
//! ```text
//! Starting ──ok──▶ Running ──hangup/config change──▶ Reloading ──ok──▶ Running
//!    │                │                                  │
//!    │ error          │ interrupt/terminate              │ fatal
//!    ▼                ▼                                  ▼
//! Terminated(1)   leave enabled? ──no──▶ Terminated(1)  Terminated(1)
//!                     │ yes
//!                     ▼
//!               GracefulShutdown ──left──▶ Terminated(0)
//!                     │ timeout / second signal
//!                     ▼
//!               ForcedShutdown ──▶ Terminated(1)
//! ```

use std::sync::Arc;

use tokio::sync::watch;

use crate::agent::{ReloadError, SubsystemFactory};
use crate::config::{ConfigProvider, EffectiveConfig, Validated};
use crate::join::{Discover, Resolver};
use crate::lifecycle::notify::{NoopNotifier, ServiceEvent, ServiceNotifier};
use crate::lifecycle::reload::ReloadPlan;
use crate::lifecycle::shutdown::{leave_gracefully, LeaveOutcome, Shutdown};
use crate::lifecycle::signals::{EventBus, EventSources, LifecycleEvent, Signal};
use crate::lifecycle::startup::{self, Started, StartupError};
use crate::lifecycle::state::{ExitStatus, LifecycleState};
use crate::lifecycle::update_check::UpdateChecker;
use crate::net::TlsMaterial;
use crate::observability::logging::LogHandle;

/// Drives one agent from startup to exit.
pub struct LifecycleController<P, F> {
    provider: P,
    factory: F,
    resolver: Arc<dyn Resolver>,
    notifier: Arc<dyn ServiceNotifier>,
    log: Option<LogHandle>,
    update_checker: Option<UpdateChecker>,
    state: watch::Sender<LifecycleState>,
}

struct Running {
    config: EffectiveConfig,
    started: Started,
    tls: Option<TlsMaterial>,
}

enum ReloadOutcome {
    Applied,
    Kept,
}

impl<P: ConfigProvider, F: SubsystemFactory> LifecycleController<P, F> {
    pub fn new(provider: P, factory: F) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            provider,
            factory,
            resolver: Arc::new(Discover::new()),
            notifier: Arc::new(NoopNotifier),
            log: None,
            update_checker: None,
            state,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ServiceNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Reapply the configured log level on every successful reload.
    pub fn with_log_handle(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    /// Run update checks while the agent is up, unless the configuration
    /// disables them.
    pub fn with_update_checker(mut self, checker: UpdateChecker) -> Self {
        self.update_checker = Some(checker);
        self
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Load the configuration through the provider, then [`run`](Self::run).
    pub async fn launch(self, sources: EventSources) -> ExitStatus {
        match self.provider.load() {
            Ok(validated) => self.run(validated, sources).await,
            Err(e) => {
                tracing::error!(error = %e, "Error loading configuration");
                self.set_state(LifecycleState::Terminated(ExitStatus::Failure));
                ExitStatus::Failure
            }
        }
    }

    /// Start from an already validated configuration and run until exit.
    pub async fn run(mut self, validated: Validated, sources: EventSources) -> ExitStatus {
        self.set_state(LifecycleState::Starting);
        report_diagnostics(&validated);
        let config = validated.config;

        let mut bus = EventBus::new(sources);
        let tasks = Shutdown::new();

        let mut running = match self.start(config, &mut bus, &tasks).await {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(error = %e, "Agent failed to start");
                self.set_state(LifecycleState::Terminated(ExitStatus::Failure));
                return ExitStatus::Failure;
            }
        };

        let status = self.event_loop(&mut running, &mut bus).await;

        tasks.trigger();
        running.started.stop();
        self.set_state(LifecycleState::Terminated(status));
        tracing::info!(exit_code = status.code(), "Agent exiting");
        status
    }

    async fn start(
        &mut self,
        config: EffectiveConfig,
        bus: &mut EventBus,
        tasks: &Shutdown,
    ) -> Result<Running, StartupError> {
        let tls = TlsMaterial::load(&config.tls).map_err(|e| StartupError::Agent(e.into()))?;
        let started = startup::start(&config, &self.factory).await?;

        if let Err(e) = bus.arm_signals() {
            started.stop();
            return Err(StartupError::Signals(e));
        }
        self.set_state(LifecycleState::Running);
        self.notifier.notify(ServiceEvent::Ready);

        startup::launch_joiners(
            &config,
            started.agent.as_ref(),
            self.resolver.clone(),
            bus.join_failure_sender(),
            tasks,
        );
        if config.update_check_enabled() {
            if let Some(checker) = self.update_checker.take() {
                checker.for_config(&config).spawn(tasks.subscribe());
            }
        }

        Ok(Running {
            config,
            started,
            tls,
        })
    }

    async fn event_loop(&mut self, running: &mut Running, bus: &mut EventBus) -> ExitStatus {
        loop {
            let event = bus.next().await;
            match event {
                LifecycleEvent::JoinFailed(role) => {
                    tracing::error!(agent_mode = %role, "Retry join exhausted, shutting down");
                    return ExitStatus::Failure;
                }
                LifecycleEvent::Signal(Signal::Pipe) => {
                    tracing::debug!("Ignoring broken pipe signal");
                }
                LifecycleEvent::Signal(Signal::Hangup) | LifecycleEvent::ConfigChanged => {
                    tracing::info!(event = ?event, "Reloading configuration");
                    if let Err(status) = self.reload(running).await {
                        return status;
                    }
                }
                LifecycleEvent::Signal(sig @ (Signal::Interrupt | Signal::Terminate)) => {
                    return self.shutdown(sig, running, bus).await;
                }
                LifecycleEvent::ShutdownRequested | LifecycleEvent::ServiceStop => {
                    return self.shutdown(Signal::Interrupt, running, bus).await;
                }
            }
        }
    }

    async fn shutdown(&mut self, sig: Signal, running: &Running, bus: &mut EventBus) -> ExitStatus {
        tracing::info!(signal = %sig, "Caught signal");
        self.notifier.notify(ServiceEvent::Stopping);

        let leave = match sig {
            Signal::Interrupt => running.config.leave_on_interrupt(),
            Signal::Terminate => running.config.leave_on_terminate(),
            Signal::Hangup | Signal::Pipe => false,
        };
        if !leave {
            return ExitStatus::Failure;
        }

        self.set_state(LifecycleState::GracefulShutdown);
        let grace = running.config.graceful_timeout();
        tracing::info!(grace = ?grace, "Gracefully shutting down agent");

        match leave_gracefully(running.started.agent.leave(), grace, bus).await {
            LeaveOutcome::Left => {
                tracing::info!("Graceful leave complete");
                ExitStatus::Clean
            }
            LeaveOutcome::Failed(e) => {
                tracing::error!(error = %e, "Error leaving cluster");
                ExitStatus::Failure
            }
            LeaveOutcome::TimedOut => {
                self.set_state(LifecycleState::ForcedShutdown);
                tracing::warn!("Timeout on graceful leave, exiting");
                ExitStatus::Failure
            }
            LeaveOutcome::Interrupted(event) => {
                self.set_state(LifecycleState::ForcedShutdown);
                tracing::warn!(event = ?event, "Second shutdown request, exiting immediately");
                ExitStatus::Failure
            }
            LeaveOutcome::JoinFailed(role) => {
                self.set_state(LifecycleState::ForcedShutdown);
                tracing::error!(agent_mode = %role, "Retry join exhausted during graceful leave");
                ExitStatus::Failure
            }
        }
    }

    /// Reload in place. `Err` carries the exit status of a fatal failure.
    async fn reload(&mut self, running: &mut Running) -> Result<(), ExitStatus> {
        self.set_state(LifecycleState::Reloading);
        self.notifier.notify(ServiceEvent::Reloading);

        let outcome = self.apply_reload(running).await?;
        if matches!(outcome, ReloadOutcome::Applied) {
            metrics::counter!("agent.reloads").increment(1);
        }

        self.set_state(LifecycleState::Running);
        self.notifier.notify(ServiceEvent::Ready);
        Ok(())
    }

    async fn apply_reload(&mut self, running: &mut Running) -> Result<ReloadOutcome, ExitStatus> {
        let validated = match self.provider.reload(running.config.log_level()) {
            Ok(v) => v,
            Err(e) if e.is_fatal_on_reload() => {
                tracing::error!(error = %e, "Failed to reload configs");
                return Err(ExitStatus::Failure);
            }
            Err(e) => {
                tracing::error!(error = %e, "Rejected reloaded configuration, keeping the current one");
                return Ok(ReloadOutcome::Kept);
            }
        };
        report_diagnostics(&validated);
        let new = validated.config;

        let tls = match TlsMaterial::load(&new.tls) {
            Ok(tls) => tls,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load TLS material, keeping the current configuration");
                return Ok(ReloadOutcome::Kept);
            }
        };
        let plan = ReloadPlan::between(&running.config, &new, tls != running.tls);
        tracing::debug!(plan = ?plan, "Reload plan");

        if let (Some(level), Some(log)) = (&plan.log_level, self.log.as_mut()) {
            if let Err(e) = log.set_level(level) {
                tracing::error!(error = %e, "Failed to apply log level");
            }
        }

        let agent = running.started.agent.clone();
        if plan.agent {
            apply(agent.reload(&new))?;
        }
        if plan.server {
            if let Some(server) = agent.server() {
                apply(server.reload(&new))?;
            }
        }
        if plan.client {
            if let Some(client) = agent.client() {
                apply(client.reload(&new))?;
            }
        }

        if plan.listeners {
            tracing::info!("Restarting HTTP listeners");
            running.started.listeners.shutdown();
            match self
                .factory
                .start_listeners(agent, &new, &running.started.telemetry)
                .await
            {
                Ok(listeners) => running.started.listeners = listeners,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to restart HTTP listeners");
                    return Err(ExitStatus::Failure);
                }
            }
        }

        running.config = new;
        running.tls = tls;
        Ok(ReloadOutcome::Applied)
    }

    fn set_state(&self, state: LifecycleState) {
        tracing::debug!(state = %state, "Lifecycle transition");
        metrics::gauge!("agent.state").set(f64::from(state.ordinal()));
        self.state.send_replace(state);
    }
}

/// Log a component reload failure. Convert errors leave the component on its
/// previous configuration; apply errors end the process.
fn apply(result: Result<(), ReloadError>) -> Result<(), ExitStatus> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "Reload failed");
            Err(ExitStatus::Failure)
        }
        Err(e) => {
            tracing::error!(error = %e, "Reload skipped for component");
            Ok(())
        }
    }
}

fn report_diagnostics(validated: &Validated) {
    for notice in &validated.notices {
        tracing::warn!("{}", notice);
    }
    for warning in &validated.warnings {
        tracing::warn!("{}", warning);
    }
}
