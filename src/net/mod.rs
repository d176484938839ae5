//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! EffectiveConfig
//!     → tls.rs (optional certificate + key, parsed and compared on reload)
//!     → listener.rs (bind, serve agent endpoints)
//!     → handle.graceful_shutdown on stop or restart
//! ```
//!
//! # Design Decisions
//! - Binding is synchronous with startup so address errors are fatal early
//! - A listener restart is a full stop and rebind, never a hot swap
//! - TLS is optional and handled transparently by axum-server

pub mod listener;
pub mod tls;

pub use listener::{HttpListeners, ListenerError, ListenerState};
pub use tls::{TlsError, TlsMaterial};
