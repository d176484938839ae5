//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from the effective configuration
//! - Switch between human readable and JSON output
//! - Change the log level at runtime on configuration reload
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - The level filter sits behind a reload layer; the formatter does not
//! - `RUST_LOG`, when set, wins over the configured level and pins it

use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log level: {0}. Valid log levels are: [OFF TRACE DEBUG INFO WARN ERROR]")]
    InvalidLevel(String),

    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to update log level: {0}")]
    Reload(#[from] reload::Error),
}

/// Parse a configured level name, case-insensitively.
pub fn parse_level(level: &str) -> Result<LevelFilter, LogError> {
    match level.to_ascii_uppercase().as_str() {
        "OFF" => Ok(LevelFilter::OFF),
        "TRACE" => Ok(LevelFilter::TRACE),
        "DEBUG" => Ok(LevelFilter::DEBUG),
        "INFO" => Ok(LevelFilter::INFO),
        "WARN" => Ok(LevelFilter::WARN),
        "ERROR" => Ok(LevelFilter::ERROR),
        _ => Err(LogError::InvalidLevel(level.to_string())),
    }
}

/// Runtime control over the installed subscriber.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
    current: LevelFilter,
}

impl LogHandle {
    pub fn level(&self) -> LevelFilter {
        self.current
    }

    /// Apply a new configured level. A no-op when `RUST_LOG` pins the filter
    /// or the level is unchanged.
    pub fn set_level(&mut self, level: &str) -> Result<(), LogError> {
        let parsed = parse_level(level)?;
        if self.env_override || parsed == self.current {
            return Ok(());
        }
        self.filter.reload(EnvFilter::new(parsed.to_string()))?;
        tracing::info!(from = %self.current, to = %parsed, "Log level changed");
        self.current = parsed;
        Ok(())
    }
}

/// Install the global subscriber.
pub fn init(level: &str, json: bool) -> Result<LogHandle, LogError> {
    let parsed = parse_level(level)?;

    let env_filter = EnvFilter::try_from_default_env().ok();
    let env_override = env_filter.is_some();
    let filter = env_filter.unwrap_or_else(|| EnvFilter::new(parsed.to_string()));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)?;

    Ok(LogHandle {
        filter: handle,
        env_override,
        current: parsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("Off").unwrap(), LevelFilter::OFF);
        assert!(matches!(
            parse_level("verbose"),
            Err(LogError::InvalidLevel(l)) if l == "verbose"
        ));
    }

    #[test]
    fn unchanged_level_skips_reload() {
        let (_layer, filter) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        let mut handle = LogHandle {
            filter,
            env_override: false,
            current: LevelFilter::INFO,
        };
        assert!(handle.set_level("INFO").is_ok());
        assert!(handle.set_level("nope").is_err());
        assert_eq!(handle.level(), LevelFilter::INFO);
    }
}
