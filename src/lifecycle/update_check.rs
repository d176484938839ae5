//! Background update check.
//!
//! Asks a checkpoint service whether a newer release exists, once after a
//! random stagger and then every 24 hours. Every outcome is a log line; a
//! failure never affects the agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::config::EffectiveConfig;

pub const DEFAULT_CHECKPOINT_URL: &str = "https://checkpoint-api.hashicorp.com/v1/check";
pub const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_STAGGER: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNATURE_FILE: &str = "checkpoint-signature";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Alert {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CheckResponse {
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub outdated: bool,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Periodic checkpoint client.
#[derive(Debug, Clone)]
pub struct UpdateChecker {
    client: reqwest::Client,
    base_url: String,
    product: String,
    version: String,
    signature_file: Option<PathBuf>,
}

impl UpdateChecker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            product: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            signature_file: None,
        }
    }

    /// Attach the anonymous signature stored in the data directory, unless
    /// the configuration disables it.
    pub fn for_config(mut self, config: &EffectiveConfig) -> Self {
        let anonymous = !config.disable_anonymous_signature.unwrap_or(false);
        self.signature_file = match (&config.data_dir, anonymous) {
            (Some(dir), true) => Some(Path::new(dir).join(SIGNATURE_FILE)),
            _ => None,
        };
        self
    }

    /// Run one check.
    pub async fn check(&self) -> Result<CheckResponse, reqwest::Error> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), self.product);
        let mut query = vec![
            ("version", self.version.clone()),
            ("os", std::env::consts::OS.to_string()),
            ("arch", std::env::consts::ARCH.to_string()),
        ];
        if let Some(signature) = self.signature_file.as_deref().and_then(read_or_create_signature) {
            query.push(("signature", signature));
        }

        self.client
            .get(url)
            .query(&query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<CheckResponse>()
            .await
    }

    /// Check after a random stagger, then on a fixed interval, until
    /// `cancel` fires.
    pub fn spawn(self, mut cancel: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let stagger = random_stagger(MAX_STAGGER);
        tokio::spawn(async move {
            let mut wait = stagger;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.recv() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                report(&self.version, self.check().await);
                wait = CHECK_INTERVAL;
            }
        })
    }
}

impl Default for UpdateChecker {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_URL)
    }
}

pub fn random_stagger(max: Duration) -> Duration {
    if max.is_zero() {
        return max;
    }
    let millis = rand::thread_rng().gen_range(0..max.as_millis() as u64);
    Duration::from_millis(millis)
}

fn report(running: &str, result: Result<CheckResponse, reqwest::Error>) {
    let response = match result {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to check for updates");
            return;
        }
    };
    if response.outdated {
        tracing::warn!(
            available = %response.current_version,
            running = %running,
            "Newer version available"
        );
    }
    for alert in &response.alerts {
        if alert.level == "info" {
            tracing::info!(level = %alert.level, url = %alert.url, "Bulletin: {}", alert.message);
        } else {
            tracing::warn!(level = %alert.level, url = %alert.url, "Bulletin: {}", alert.message);
        }
    }
}

fn read_or_create_signature(path: &Path) -> Option<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Some(existing.to_string());
        }
    }
    let signature = uuid::Uuid::new_v4().to_string();
    match std::fs::write(path, &signature) {
        Ok(()) => Some(signature),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Could not persist update check signature");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stagger_stays_in_bounds() {
        for _ in 0..100 {
            assert!(random_stagger(MAX_STAGGER) < MAX_STAGGER);
        }
        assert_eq!(random_stagger(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn signature_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SIGNATURE_FILE);
        let first = read_or_create_signature(&path).unwrap();
        let second = read_or_create_signature(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let parsed: CheckResponse =
            serde_json::from_str(r#"{"outdated": true, "current_version": "1.9.0"}"#).unwrap();
        assert!(parsed.outdated);
        assert!(parsed.alerts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_check() {
        let (tx, rx) = broadcast::channel(1);
        let handle = UpdateChecker::new("http://127.0.0.1:9").spawn(rx);
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
