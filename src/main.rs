//! Cluster agent (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!   flags ─┐
//!   files ─┼─▶ config (assemble → validate) ─▶ EffectiveConfig
//!   env   ─┘                                      │
//!                                                 ▼
//!   signals ──────────▶ lifecycle controller ──▶ agent (server / client roles)
//!   config watcher ───▶   (event bus)        ──▶ net (HTTP listeners)
//!   join failures ────▶                      ──▶ join (retry coordinators)
//!                                            ──▶ observability (logs, metrics)
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use cluster_agent::agent::local::LocalFactory;
use cluster_agent::cli::{Cli, Commands};
use cluster_agent::config::watcher::ConfigWatcher;
use cluster_agent::config::ConfigProvider;
use cluster_agent::lifecycle::update_check::UpdateChecker;
use cluster_agent::lifecycle::{EventSources, LifecycleController, SystemdNotifier};
use cluster_agent::observability::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Cli::parse().command {
        Commands::Agent(args) => args,
    };

    let validated = match args.load() {
        Ok(validated) => validated,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let log = match logging::init(validated.config.log_level(), validated.config.log_json()) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut sources = EventSources::os();
    // Kept alive for the whole run.
    let _watcher = if args.watch_config {
        let (watcher, changes) = ConfigWatcher::new(args.watch_paths());
        match watcher.run() {
            Ok(handle) => {
                sources.config_changes = Some(changes);
                Some(handle)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to watch configuration paths");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    LifecycleController::new(args, LocalFactory)
        .with_log_handle(log)
        .with_notifier(Arc::new(SystemdNotifier::from_env()))
        .with_update_checker(UpdateChecker::default())
        .run(validated, sources)
        .await
        .into()
}
