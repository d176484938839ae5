//! HTTP listener set.
//!
//! # Responsibilities
//! - Bind the agent's HTTP address, plain or TLS
//! - Serve the agent status and metrics endpoints
//! - Stop gracefully so a reload can rebind the same address

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::agent::{Agent, Listeners};
use crate::config::EffectiveConfig;
use crate::observability::telemetry::TelemetryHandles;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid HTTP address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS configuration: {0}")]
    Tls(std::io::Error),
}

/// State shared with every handler.
#[derive(Clone)]
pub struct ListenerState {
    pub agent: Arc<dyn Agent>,
    pub config: EffectiveConfig,
    pub telemetry: TelemetryHandles,
}

#[derive(Serialize)]
struct HealthResponse {
    server: Option<bool>,
    client: Option<bool>,
}

#[derive(Serialize)]
struct SelfResponse {
    node_id: String,
    name: Option<String>,
    region: Option<String>,
    datacenter: Option<String>,
    server: bool,
    client: bool,
    version: &'static str,
}

#[derive(Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn health(State(state): State<ListenerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        server: state.agent.server().map(|_| true),
        client: state.agent.client().map(|_| true),
    })
}

async fn agent_self(State(state): State<ListenerState>) -> Json<SelfResponse> {
    let config = &state.config;
    Json(SelfResponse {
        node_id: state.agent.node_id().to_string(),
        name: config.name.clone(),
        region: config.region.clone(),
        datacenter: config.datacenter.clone(),
        server: state.agent.server().is_some(),
        client: state.agent.client().is_some(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn agent_metrics(
    State(state): State<ListenerState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    match (query.format.as_deref(), &state.telemetry.prometheus) {
        (Some("prometheus"), Some(handle)) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        (Some("prometheus"), None) => (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Prometheus metrics are not enabled",
        )
            .into_response(),
        _ => Json(state.telemetry.inmem.snapshot()).into_response(),
    }
}

/// Routes served on the agent HTTP address.
pub fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/v1/agent/health", get(health))
        .route("/v1/agent/self", get(agent_self))
        .route("/v1/metrics", get(agent_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Running HTTP servers, stopped through their handles.
pub struct HttpListeners {
    handles: Vec<Handle>,
    addrs: Vec<SocketAddr>,
}

impl HttpListeners {
    /// Bind and serve. Binding happens before this returns so bind errors
    /// surface as startup failures.
    pub async fn start(
        addr: SocketAddr,
        tls: Option<RustlsConfig>,
        app: Router,
    ) -> Result<Self, ListenerError> {
        let listener = std::net::TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let handle = Handle::new();
        let service = app.into_make_service();
        let tls_enabled = tls.is_some();
        let server = match tls {
            Some(config) => tokio::spawn(
                axum_server::from_tcp_rustls(listener, config)
                    .handle(handle.clone())
                    .serve(service),
            ),
            None => tokio::spawn(
                axum_server::from_tcp(listener)
                    .handle(handle.clone())
                    .serve(service),
            ),
        };
        tokio::spawn(async move {
            match server.await {
                Ok(Ok(())) => tracing::debug!(address = %local_addr, "HTTP listener stopped"),
                Ok(Err(e)) => tracing::error!(address = %local_addr, error = %e, "HTTP listener failed"),
                Err(e) => tracing::error!(address = %local_addr, error = %e, "HTTP listener task panicked"),
            }
        });

        tracing::info!(address = %local_addr, tls = tls_enabled, "HTTP listener bound");
        Ok(Self {
            handles: vec![handle],
            addrs: vec![local_addr],
        })
    }
}

impl Listeners for HttpListeners {
    fn addrs(&self) -> Vec<SocketAddr> {
        self.addrs.clone()
    }

    fn shutdown(&self) {
        for handle in &self.handles {
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalAgent;
    use crate::config::{build, RawConfigSource};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn serves_agent_endpoints_and_stops() {
        let mut cli = crate::config::AgentConfig::default();
        cli.ports.http = Some(0);
        let config = build(
            [RawConfigSource::DevMode, RawConfigSource::Cli(cli)],
            &HashMap::<String, String>::new(),
        )
        .unwrap()
        .config;

        let agent: Arc<dyn Agent> = Arc::new(LocalAgent::new(&config));
        let state = ListenerState {
            agent: agent.clone(),
            config: config.clone(),
            telemetry: TelemetryHandles::detached(),
        };
        let listeners = HttpListeners::start(config.http_addr().unwrap(), None, router(state))
            .await
            .unwrap();
        let addr = listeners.addrs()[0];

        let body = get(addr, "/v1/agent/self").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains(agent.node_id()));

        let body = get(addr, "/v1/metrics?format=prometheus").await;
        assert!(body.starts_with("HTTP/1.1 415"));

        listeners.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
