//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, reloadable level)
//!     → metrics facade (counters, gauges, histograms)
//!
//! telemetry.rs builds the recorder stack once at startup:
//!     prefix filter + host label
//!         → metrics.rs fan-out
//!             → inmem ring buffer (always)
//!             → statsite / statsd / datadog line sinks
//!             → prometheus exporter
//!             → hosted metrics provider
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - The log level can change on reload; the sink topology cannot
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod telemetry;
