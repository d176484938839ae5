//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → telemetry → agent → listeners → start_join
//!     → arm signals → READY → retry joiners + update check
//!
//! Events (signals.rs):
//!     join failure | OS signal | shutdown request | service stop | config change
//!     → EventBus (biased, one at a time)
//!     → controller.rs
//!
//! Reload (reload.rs):
//!     SIGHUP or config change → reload config → ReloadPlan → touched components
//!
//! Shutdown (shutdown.rs):
//!     SIGINT/SIGTERM → leave (if enabled) raced against grace window → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Reload blocks the event loop, so reloads never overlap
//! - Shutdown has timeout: forced exit after deadline
//! - A second shutdown request always wins over a pending leave

pub mod controller;
pub mod notify;
pub mod reload;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;
pub mod update_check;

pub use controller::LifecycleController;
pub use notify::{NoopNotifier, ServiceEvent, ServiceNotifier, SystemdNotifier};
pub use shutdown::Shutdown;
pub use signals::{EventSources, LifecycleEvent, Signal, SignalSource};
pub use startup::StartupError;
pub use state::{ExitStatus, LifecycleState};
