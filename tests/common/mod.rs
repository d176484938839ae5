//! Shared fakes for lifecycle and join integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use cluster_agent::agent::{Agent, AgentError, Listeners, ReloadError, Subsystem, SubsystemFactory};
use cluster_agent::config::{self, AgentConfig, ConfigError, ConfigProvider, EffectiveConfig, RawConfigSource, Validated};
use cluster_agent::join::{JoinError, Role};
use cluster_agent::lifecycle::notify::RecordingNotifier;
use cluster_agent::lifecycle::{
    EventSources, ExitStatus, LifecycleController, LifecycleState, ServiceEvent, Signal, SignalSource,
};
use cluster_agent::observability::telemetry::TelemetryHandles;

/// Dev-mode configuration with `overlay` applied last.
pub fn dev_config(overlay: AgentConfig) -> Validated {
    config::build(
        [RawConfigSource::DevMode, RawConfigSource::Cli(overlay)],
        &HashMap::<String, String>::new(),
    )
    .unwrap()
}

/// Serves scripted load results in order, then repeats the last success.
pub struct ScriptedProvider {
    loads: Mutex<VecDeque<Result<Validated, ConfigError>>>,
    last: Mutex<Option<Validated>>,
}

impl ScriptedProvider {
    pub fn new(loads: Vec<Result<Validated, ConfigError>>) -> Self {
        Self {
            loads: Mutex::new(loads.into()),
            last: Mutex::new(None),
        }
    }

    pub fn repeating(config: Validated) -> Self {
        Self::new(vec![Ok(config)])
    }
}

impl ConfigProvider for ScriptedProvider {
    fn load(&self) -> Result<Validated, ConfigError> {
        match self.loads.lock().unwrap().pop_front() {
            Some(Ok(validated)) => {
                *self.last.lock().unwrap() = Some(validated.clone());
                Ok(validated)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ConfigError::Flag("nothing scripted".into())),
        }
    }
}

/// Builds dev-mode overlays through the real assembly pipeline, in order,
/// then repeats the last one. Reloads go through the reload build path.
pub struct OverlayProvider {
    overlays: Mutex<VecDeque<AgentConfig>>,
    last: Mutex<AgentConfig>,
}

impl OverlayProvider {
    pub fn new(overlays: Vec<AgentConfig>) -> Self {
        Self {
            overlays: Mutex::new(overlays.into()),
            last: Mutex::new(AgentConfig::default()),
        }
    }

    fn next(&self) -> Vec<RawConfigSource> {
        let mut last = self.last.lock().unwrap();
        if let Some(overlay) = self.overlays.lock().unwrap().pop_front() {
            *last = overlay;
        }
        vec![RawConfigSource::DevMode, RawConfigSource::Cli(last.clone())]
    }
}

impl ConfigProvider for OverlayProvider {
    fn load(&self) -> Result<Validated, ConfigError> {
        Ok(config::build(self.next(), &HashMap::<String, String>::new())?)
    }

    fn reload(&self, current_log_level: &str) -> Result<Validated, ConfigError> {
        Ok(config::build_reload(
            self.next(),
            &HashMap::<String, String>::new(),
            current_log_level,
        )?)
    }
}

/// Call counters shared by every fake.
#[derive(Debug, Default)]
pub struct Calls {
    pub agents_started: AtomicUsize,
    pub agent_shutdowns: AtomicUsize,
    pub agent_reloads: AtomicUsize,
    pub server_reloads: AtomicUsize,
    pub client_reloads: AtomicUsize,
    pub listeners_started: AtomicUsize,
    pub listener_shutdowns: AtomicUsize,
    pub leaves: AtomicUsize,
    pub joins: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadBehavior {
    Ok,
    Convert,
    Apply,
}

/// How the fakes behave.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub leave_delay: Duration,
    pub leave_fails: bool,
    /// Join calls that fail before one succeeds.
    pub join_failures: usize,
    pub join_peers: usize,
    pub client_reload: ReloadBehavior,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            leave_delay: Duration::from_millis(100),
            leave_fails: false,
            join_failures: 0,
            join_peers: 1,
            client_reload: ReloadBehavior::Ok,
        }
    }
}

pub struct FakeSubsystem {
    role: Role,
    calls: Arc<Calls>,
    behavior: Behavior,
    failures_left: AtomicUsize,
}

impl Subsystem for FakeSubsystem {
    fn role(&self) -> Role {
        self.role
    }

    fn reload(&self, _config: &EffectiveConfig) -> Result<(), ReloadError> {
        match self.role {
            Role::Server => {
                self.calls.server_reloads.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Role::Client => {
                self.calls.client_reloads.fetch_add(1, Ordering::SeqCst);
                match self.behavior.client_reload {
                    ReloadBehavior::Ok => Ok(()),
                    ReloadBehavior::Convert => Err(ReloadError::Convert {
                        component: "client",
                        reason: "scripted".into(),
                    }),
                    ReloadBehavior::Apply => Err(ReloadError::Apply {
                        component: "client",
                        reason: "scripted".into(),
                    }),
                }
            }
        }
    }

    fn join(&self, _addrs: Vec<String>) -> BoxFuture<'static, Result<usize, JoinError>> {
        self.calls.joins.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let peers = self.behavior.join_peers;
        async move {
            if fail {
                Err(JoinError::Rejected("scripted".into()))
            } else {
                Ok(peers)
            }
        }
        .boxed()
    }
}

pub struct FakeAgent {
    calls: Arc<Calls>,
    behavior: Behavior,
    server: Option<Arc<FakeSubsystem>>,
    client: Option<Arc<FakeSubsystem>>,
}

impl Agent for FakeAgent {
    fn node_id(&self) -> &str {
        "fake-node"
    }

    fn server(&self) -> Option<Arc<dyn Subsystem>> {
        self.server.clone().map(|s| s as Arc<dyn Subsystem>)
    }

    fn client(&self) -> Option<Arc<dyn Subsystem>> {
        self.client.clone().map(|c| c as Arc<dyn Subsystem>)
    }

    fn reload(&self, _config: &EffectiveConfig) -> Result<(), ReloadError> {
        self.calls.agent_reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn leave(&self) -> BoxFuture<'static, Result<(), AgentError>> {
        self.calls.leaves.fetch_add(1, Ordering::SeqCst);
        let delay = self.behavior.leave_delay;
        let fails = self.behavior.leave_fails;
        async move {
            tokio::time::sleep(delay).await;
            if fails {
                Err(AgentError::Leave("scripted".into()))
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn shutdown(&self) {
        self.calls.agent_shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeListeners {
    calls: Arc<Calls>,
}

impl Listeners for FakeListeners {
    fn addrs(&self) -> Vec<SocketAddr> {
        vec![SocketAddr::from(([127, 0, 0, 1], 4646))]
    }

    fn shutdown(&self) {
        self.calls.listener_shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeFactory {
    pub calls: Arc<Calls>,
    pub behavior: Behavior,
}

impl SubsystemFactory for FakeFactory {
    fn start_agent(
        &self,
        config: &EffectiveConfig,
        _telemetry: &TelemetryHandles,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        self.calls.agents_started.fetch_add(1, Ordering::SeqCst);
        let subsystem = |role| {
            Arc::new(FakeSubsystem {
                role,
                calls: self.calls.clone(),
                behavior: self.behavior.clone(),
                failures_left: AtomicUsize::new(self.behavior.join_failures),
            })
        };
        Ok(Arc::new(FakeAgent {
            calls: self.calls.clone(),
            behavior: self.behavior.clone(),
            server: config.server.is_enabled().then(|| subsystem(Role::Server)),
            client: config.client.is_enabled().then(|| subsystem(Role::Client)),
        }))
    }

    fn start_listeners(
        &self,
        _agent: Arc<dyn Agent>,
        _config: &EffectiveConfig,
        _telemetry: &TelemetryHandles,
    ) -> BoxFuture<'static, Result<Box<dyn Listeners>, AgentError>> {
        self.calls.listeners_started.fetch_add(1, Ordering::SeqCst);
        let listeners = FakeListeners {
            calls: self.calls.clone(),
        };
        async move { Ok(Box::new(listeners) as Box<dyn Listeners>) }.boxed()
    }
}

/// A controller running on its own task with every event source injectable.
pub struct Harness {
    pub signals: mpsc::UnboundedSender<Signal>,
    pub shutdown_requests: mpsc::UnboundedSender<()>,
    pub service_stop: mpsc::UnboundedSender<()>,
    pub config_changes: mpsc::UnboundedSender<()>,
    pub calls: Arc<Calls>,
    pub notifier: Arc<RecordingNotifier>,
    pub state: watch::Receiver<LifecycleState>,
    handle: JoinHandle<ExitStatus>,
}

impl Harness {
    pub fn launch<P: ConfigProvider + 'static>(provider: P, behavior: Behavior) -> Self {
        let calls = Arc::new(Calls::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_requests, shutdown_rx) = mpsc::unbounded_channel();
        let (service_stop, stop_rx) = mpsc::unbounded_channel();
        let (config_changes, change_rx) = mpsc::unbounded_channel();
        let sources = EventSources {
            signals: SignalSource::Injected(signal_rx),
            shutdown_requests: Some(shutdown_rx),
            service_stop: Some(stop_rx),
            config_changes: Some(change_rx),
        };

        let factory = FakeFactory {
            calls: calls.clone(),
            behavior,
        };
        let controller =
            LifecycleController::new(provider, factory).with_notifier(notifier.clone());
        let state = controller.state();
        let handle = tokio::spawn(controller.launch(sources));

        Self {
            signals,
            shutdown_requests,
            service_stop,
            config_changes,
            calls,
            notifier,
            state,
            handle,
        }
    }

    /// Wait until the controller reaches Running or terminates.
    pub async fn running(&mut self) -> LifecycleState {
        *self
            .state
            .wait_for(|s| *s == LifecycleState::Running || s.is_terminal())
            .await
            .unwrap()
    }

    /// Let the controller drain everything already queued.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pub fn signal(&self, sig: Signal) {
        self.signals.send(sig).unwrap();
    }

    pub fn events(&self) -> Vec<ServiceEvent> {
        self.notifier.events()
    }

    pub async fn exit(self) -> ExitStatus {
        self.handle.await.unwrap()
    }
}
