//! Lifecycle controller behaviour against fake subsystems.

use std::time::Duration;

use cluster_agent::config::validation::Diagnostics;
use cluster_agent::config::{AgentConfig, ConfigError};
use cluster_agent::lifecycle::{ExitStatus, LifecycleState, ServiceEvent, Signal};

mod common;
use common::{
    dev_config, Behavior, Calls, Harness, OverlayProvider, ReloadBehavior, ScriptedProvider,
};

fn leave_on_signals() -> AgentConfig {
    AgentConfig {
        leave_on_interrupt: Some(true),
        leave_on_terminate: Some(true),
        ..AgentConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn single_terminate_with_leave_exits_clean() {
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        Behavior::default(),
    );
    assert_eq!(h.running().await, LifecycleState::Running);

    h.signal(Signal::Terminate);
    let calls = h.calls.clone();
    let notifier = h.notifier.clone();
    assert_eq!(h.exit().await, ExitStatus::Clean);

    assert_eq!(Calls::get(&calls.leaves), 1);
    assert_eq!(Calls::get(&calls.agent_shutdowns), 1);
    assert_eq!(notifier.events(), vec![ServiceEvent::Ready, ServiceEvent::Stopping]);
}

#[tokio::test(start_paused = true)]
async fn second_signal_during_leave_forces_failure() {
    let behavior = Behavior {
        leave_delay: Duration::from_secs(3),
        ..Behavior::default()
    };
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        behavior,
    );
    h.running().await;

    h.signal(Signal::Terminate);
    h.signal(Signal::Interrupt);
    let mut state = h.state.clone();
    assert_eq!(h.exit().await, ExitStatus::Failure);
    assert_eq!(
        *state.borrow_and_update(),
        LifecycleState::Terminated(ExitStatus::Failure)
    );
}

#[tokio::test(start_paused = true)]
async fn hangup_during_leave_forces_failure() {
    let behavior = Behavior {
        leave_delay: Duration::from_secs(3),
        ..Behavior::default()
    };
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        behavior,
    );
    h.running().await;

    h.signal(Signal::Terminate);
    h.signal(Signal::Hangup);
    let calls = h.calls.clone();
    assert_eq!(h.exit().await, ExitStatus::Failure);
    assert_eq!(Calls::get(&calls.agent_reloads), 0);
}

#[tokio::test(start_paused = true)]
async fn broken_pipe_never_changes_state() {
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        Behavior::default(),
    );
    h.running().await;

    h.signal(Signal::Pipe);
    h.signal(Signal::Pipe);
    h.settle().await;
    assert_eq!(*h.state.borrow(), LifecycleState::Running);
    assert_eq!(h.events(), vec![ServiceEvent::Ready]);

    h.signal(Signal::Interrupt);
    assert_eq!(h.exit().await, ExitStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn signal_without_leave_exits_with_failure() {
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(AgentConfig::default())),
        Behavior::default(),
    );
    h.running().await;

    h.signal(Signal::Interrupt);
    let calls = h.calls.clone();
    assert_eq!(h.exit().await, ExitStatus::Failure);
    assert_eq!(Calls::get(&calls.leaves), 0);
}

#[tokio::test(start_paused = true)]
async fn leave_past_grace_window_fails() {
    let behavior = Behavior {
        leave_delay: Duration::from_secs(60),
        ..Behavior::default()
    };
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        behavior,
    );
    h.running().await;

    let start = tokio::time::Instant::now();
    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Failure);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn drain_deadline_extends_grace_window() {
    let mut overlay = leave_on_signals();
    overlay.client.drain.deadline = Some(Duration::from_secs(10));
    let behavior = Behavior {
        leave_delay: Duration::from_secs(12),
        ..Behavior::default()
    };
    let mut h = Harness::launch(ScriptedProvider::repeating(dev_config(overlay)), behavior);
    h.running().await;

    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn failed_leave_exits_with_failure() {
    let behavior = Behavior {
        leave_fails: true,
        ..Behavior::default()
    };
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        behavior,
    );
    h.running().await;

    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn shutdown_request_and_service_stop_follow_interrupt_path() {
    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(leave_on_signals())),
        Behavior::default(),
    );
    h.running().await;
    h.shutdown_requests.send(()).unwrap();
    assert_eq!(h.exit().await, ExitStatus::Clean);

    let mut h = Harness::launch(
        ScriptedProvider::repeating(dev_config(AgentConfig::default())),
        Behavior::default(),
    );
    h.running().await;
    h.service_stop.send(()).unwrap();
    assert_eq!(h.exit().await, ExitStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn join_exhaustion_terminates_the_agent() {
    let mut overlay = AgentConfig::default();
    overlay.client.server_join.retry_join = vec!["10.0.0.1:4647".into()];
    overlay.client.server_join.retry_max_attempts = Some(2);
    overlay.client.server_join.retry_interval = Some(Duration::from_secs(1));
    let behavior = Behavior {
        join_failures: usize::MAX,
        ..Behavior::default()
    };

    let mut h = Harness::launch(ScriptedProvider::repeating(dev_config(overlay)), behavior);
    h.running().await;
    let calls = h.calls.clone();
    assert_eq!(h.exit().await, ExitStatus::Failure);
    assert_eq!(Calls::get(&calls.joins), 2);
}

#[tokio::test(start_paused = true)]
async fn successful_retry_join_keeps_running() {
    let mut overlay = leave_on_signals();
    overlay.client.server_join.retry_join = vec!["10.0.0.1:4647".into()];
    overlay.client.server_join.retry_max_attempts = Some(3);
    overlay.client.server_join.retry_interval = Some(Duration::from_secs(1));
    let behavior = Behavior {
        join_failures: 1,
        join_peers: 0,
        ..Behavior::default()
    };

    let mut h = Harness::launch(ScriptedProvider::repeating(dev_config(overlay)), behavior);
    h.running().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(Calls::get(&h.calls.joins), 2);
    assert_eq!(*h.state.borrow(), LifecycleState::Running);

    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn unrelated_reload_touches_nothing() {
    let first = dev_config(leave_on_signals());
    let second = dev_config(AgentConfig {
        log_level: Some("WARN".into()),
        ..leave_on_signals()
    });
    let mut h = Harness::launch(
        ScriptedProvider::new(vec![Ok(first), Ok(second)]),
        Behavior::default(),
    );
    h.running().await;

    h.signal(Signal::Hangup);
    h.settle().await;
    assert_eq!(*h.state.borrow(), LifecycleState::Running);

    h.signal(Signal::Terminate);
    let calls = h.calls.clone();
    let notifier = h.notifier.clone();
    assert_eq!(h.exit().await, ExitStatus::Clean);

    assert_eq!(Calls::get(&calls.agent_reloads), 0);
    assert_eq!(Calls::get(&calls.server_reloads), 0);
    assert_eq!(Calls::get(&calls.client_reloads), 0);
    assert_eq!(Calls::get(&calls.listeners_started), 1);
    assert_eq!(
        notifier.events(),
        vec![
            ServiceEvent::Ready,
            ServiceEvent::Reloading,
            ServiceEvent::Ready,
            ServiceEvent::Stopping
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn tls_change_restarts_listeners_once() {
    let first = dev_config(leave_on_signals());
    let mut overlay = leave_on_signals();
    overlay.tls.enable_rpc = Some(true);
    let second = dev_config(overlay);

    let mut h = Harness::launch(
        ScriptedProvider::new(vec![Ok(first), Ok(second)]),
        Behavior::default(),
    );
    h.running().await;

    h.config_changes.send(()).unwrap();
    h.settle().await;
    assert_eq!(Calls::get(&h.calls.listeners_started), 2);
    assert_eq!(Calls::get(&h.calls.listener_shutdowns), 1);

    // Same configuration again: nothing to restart.
    h.signal(Signal::Hangup);
    h.settle().await;
    assert_eq!(Calls::get(&h.calls.listeners_started), 2);

    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn bad_log_level_on_reload_keeps_the_rest_of_the_change() {
    let mut changed = AgentConfig {
        log_level: Some("chatty".into()),
        ..leave_on_signals()
    };
    changed.tls.enable_rpc = Some(true);

    let mut h = Harness::launch(
        OverlayProvider::new(vec![leave_on_signals(), changed]),
        Behavior::default(),
    );
    h.running().await;

    h.signal(Signal::Hangup);
    h.settle().await;
    assert_eq!(*h.state.borrow(), LifecycleState::Running);
    assert_eq!(Calls::get(&h.calls.listeners_started), 2);
    assert_eq!(Calls::get(&h.calls.listener_shutdowns), 1);

    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn convert_error_keeps_running_and_apply_error_is_fatal() {
    let mut changed = leave_on_signals();
    changed.client.meta.insert("rack".into(), "r2".into());

    let behavior = Behavior {
        client_reload: ReloadBehavior::Convert,
        ..Behavior::default()
    };
    let mut h = Harness::launch(
        ScriptedProvider::new(vec![
            Ok(dev_config(leave_on_signals())),
            Ok(dev_config(changed.clone())),
        ]),
        behavior,
    );
    h.running().await;
    h.signal(Signal::Hangup);
    h.settle().await;
    assert_eq!(Calls::get(&h.calls.client_reloads), 1);
    assert_eq!(*h.state.borrow(), LifecycleState::Running);
    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Clean);

    let behavior = Behavior {
        client_reload: ReloadBehavior::Apply,
        ..Behavior::default()
    };
    let mut h = Harness::launch(
        ScriptedProvider::new(vec![
            Ok(dev_config(leave_on_signals())),
            Ok(dev_config(changed)),
        ]),
        behavior,
    );
    h.running().await;
    h.signal(Signal::Hangup);
    assert_eq!(h.exit().await, ExitStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn rejected_reload_keeps_current_config() {
    let rejected = ConfigError::Rejected(Diagnostics {
        fatal: vec!["must specify either server, client or dev mode for the agent".into()],
        warnings: vec![],
    });
    let mut h = Harness::launch(
        ScriptedProvider::new(vec![Ok(dev_config(leave_on_signals())), Err(rejected)]),
        Behavior::default(),
    );
    h.running().await;

    h.signal(Signal::Hangup);
    h.settle().await;
    assert_eq!(*h.state.borrow(), LifecycleState::Running);

    h.signal(Signal::Terminate);
    assert_eq!(h.exit().await, ExitStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn unparseable_reload_is_fatal() {
    let parse = ConfigError::Parse {
        path: "/etc/agent/agent.toml".into(),
        message: "expected `=`".into(),
    };
    let mut h = Harness::launch(
        ScriptedProvider::new(vec![Ok(dev_config(leave_on_signals())), Err(parse)]),
        Behavior::default(),
    );
    h.running().await;

    h.signal(Signal::Hangup);
    assert_eq!(h.exit().await, ExitStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn rejected_startup_starts_nothing() {
    let rejected = cluster_agent::config::build(
        [cluster_agent::config::RawConfigSource::Defaults],
        &std::collections::HashMap::<String, String>::new(),
    )
    .unwrap_err();
    assert!(rejected
        .fatal
        .iter()
        .any(|e| e == "must specify either server, client or dev mode for the agent"));

    let mut h = Harness::launch(
        ScriptedProvider::new(vec![Err(rejected.into())]),
        Behavior::default(),
    );
    assert_eq!(
        h.running().await,
        LifecycleState::Terminated(ExitStatus::Failure)
    );
    let calls = h.calls.clone();
    let notifier = h.notifier.clone();
    assert_eq!(h.exit().await, ExitStatus::Failure);
    assert_eq!(Calls::get(&calls.agents_started), 0);
    assert_eq!(Calls::get(&calls.listeners_started), 0);
    assert!(notifier.events().is_empty());
}
