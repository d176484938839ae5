//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults | dev overlay
//!     → enterprise overlay
//!     → config files (loader.rs, in order)
//!     → CLI overlay
//!     → merge.rs (right-biased assemble + finalize)
//!     → validation.rs (fatal diagnostics + warnings)
//!     → EffectiveConfig (validated, immutable)
//!
//! On reload (hangup or watcher.rs):
//!     the same pipeline runs again from scratch
//!     → an invalid log level keeps the running level (warning only)
//!     → rejected: keep the current EffectiveConfig
//!     → accepted: replace it wholesale
//! ```
//!
//! # Design Decisions
//! - Every scalar is optional so "unset" survives merging
//! - Environment overrides are applied after merging, through a trait
//! - Validation separates syntactic (serde) from semantic checks

pub mod effective;
pub mod loader;
pub mod merge;
pub mod ports;
pub mod schema;
pub mod sources;
pub mod validation;
pub mod watcher;

pub use effective::EffectiveConfig;
pub use loader::ConfigError;
pub use schema::AgentConfig;
pub use sources::{Environment, RawConfigSource, SystemEnvironment};
pub use validation::{Diagnostics, Validated};

/// Produces a validated configuration on demand: once at startup and again
/// for every reload request.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<Validated, ConfigError>;

    /// Load for a reload. An invalid log level falls back to
    /// `current_log_level` with a warning instead of rejecting the whole
    /// configuration.
    fn reload(&self, current_log_level: &str) -> Result<Validated, ConfigError> {
        let _ = current_log_level;
        self.load()
    }

    /// Paths a change watcher should observe.
    fn watch_paths(&self) -> Vec<std::path::PathBuf> {
        Vec::new()
    }
}

/// Assemble, finalize and validate an ordered list of sources.
pub fn build<I>(sources: I, env: &dyn Environment) -> Result<Validated, Diagnostics>
where
    I: IntoIterator<Item = RawConfigSource>,
{
    build_with(sources, env, None)
}

/// [`build`] for a reload: an invalid log level is replaced by
/// `current_log_level` and reported as a warning.
pub fn build_reload<I>(
    sources: I,
    env: &dyn Environment,
    current_log_level: &str,
) -> Result<Validated, Diagnostics>
where
    I: IntoIterator<Item = RawConfigSource>,
{
    build_with(sources, env, Some(current_log_level))
}

fn build_with<I>(
    sources: I,
    env: &dyn Environment,
    keep_log_level: Option<&str>,
) -> Result<Validated, Diagnostics>
where
    I: IntoIterator<Item = RawConfigSource>,
{
    let raw = merge::assemble(sources);
    let mut assembled = merge::finalize(raw, env);
    let kept = keep_log_level
        .and_then(|current| validation::keep_log_level(&mut assembled.config, current));

    let mut validated = validation::validate(assembled.config)?;
    if let Some(warning) = kept {
        validated.warnings.insert(0, warning);
    }
    Ok(validated.with_notices(assembled.notices))
}
