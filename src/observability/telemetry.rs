//! Telemetry fan-out construction.
//!
//! # Data Flow
//! ```text
//! TelemetryConfig
//!     → SinkDescriptor::from_telemetry (closed list, in-memory first)
//!     → build (every sink constructed, or none)
//!     → FilteredRecorder<FanoutRecorder>
//!     → install (global recorder, background flushers)
//! ```
//!
//! # Design Decisions
//! - Sink constructors do no I/O beyond address resolution; sockets open in
//!   the flush tasks started by `install`
//! - Hostname labelling is on only when an external sink exists
//! - The global recorder is set once per process
//! - Line-protocol sinks queue into a bounded channel and drop when it is
//!   full; the statsite stream reconnects with backoff

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::config::schema::TelemetryConfig;
use crate::observability::metrics::{FanoutRecorder, FilteredRecorder, InmemSink, PrefixFilter};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_RETENTION: Duration = Duration::from_secs(60);
const DEFAULT_HOSTED_API: &str = "https://api.circonus.com/v2";
const PROMETHEUS_UPKEEP: Duration = Duration::from_secs(5);

/// Lines buffered per line-protocol sink; newer lines are dropped when full.
const LINE_QUEUE: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid telemetry {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{sink} sink: cannot resolve {address:?}: {reason}")]
    Address {
        sink: &'static str,
        address: String,
        reason: String,
    },

    #[error("hosted metrics sink: {0}")]
    Hosted(String),
}

/// Settings for the hosted metrics provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedSettings {
    pub api_token: Option<String>,
    pub api_app: Option<String>,
    pub api_url: Option<String>,
    pub submission_url: Option<String>,
    pub submission_interval: Duration,
    pub check_id: Option<String>,
    pub check_display_name: Option<String>,
    pub check_search_tag: Option<String>,
    pub broker_id: Option<String>,
}

/// One metrics destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkDescriptor {
    Inmem { interval: Duration, retention: Duration },
    Statsite { address: String },
    Statsd { address: String },
    Prometheus,
    Datadog { address: String, tags: Vec<String> },
    Hosted(HostedSettings),
}

impl SinkDescriptor {
    /// Derive the sink list. The in-memory sink is always first.
    pub fn from_telemetry(telemetry: &TelemetryConfig) -> Result<Vec<Self>, TelemetryError> {
        let mut sinks = vec![SinkDescriptor::Inmem {
            interval: parse_duration(
                "collection_interval",
                telemetry.collection_interval.as_deref(),
                DEFAULT_INTERVAL,
            )?,
            retention: parse_duration(
                "in_memory_retention_period",
                telemetry.in_memory_retention_period.as_deref(),
                DEFAULT_RETENTION,
            )?,
        }];

        if let Some(address) = non_empty(&telemetry.statsite_address) {
            sinks.push(SinkDescriptor::Statsite { address });
        }
        if let Some(address) = non_empty(&telemetry.statsd_address) {
            sinks.push(SinkDescriptor::Statsd { address });
        }
        if telemetry.prometheus_metrics.unwrap_or(false) {
            sinks.push(SinkDescriptor::Prometheus);
        }
        if let Some(address) = non_empty(&telemetry.datadog_address) {
            sinks.push(SinkDescriptor::Datadog {
                address,
                tags: telemetry.datadog_tags.clone(),
            });
        }
        if non_empty(&telemetry.circonus_api_token).is_some()
            || non_empty(&telemetry.circonus_submission_url).is_some()
        {
            sinks.push(SinkDescriptor::Hosted(HostedSettings {
                api_token: non_empty(&telemetry.circonus_api_token),
                api_app: non_empty(&telemetry.circonus_api_app),
                api_url: non_empty(&telemetry.circonus_api_url),
                submission_url: non_empty(&telemetry.circonus_submission_url),
                submission_interval: parse_duration(
                    "circonus_submission_interval",
                    telemetry.circonus_submission_interval.as_deref(),
                    DEFAULT_INTERVAL,
                )?,
                check_id: non_empty(&telemetry.circonus_check_id),
                check_display_name: non_empty(&telemetry.circonus_check_display_name),
                check_search_tag: non_empty(&telemetry.circonus_check_search_tag),
                broker_id: non_empty(&telemetry.circonus_broker_id),
            }));
        }

        Ok(sinks)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SinkDescriptor::Inmem { .. } => "inmem",
            SinkDescriptor::Statsite { .. } => "statsite",
            SinkDescriptor::Statsd { .. } => "statsd",
            SinkDescriptor::Prometheus => "prometheus",
            SinkDescriptor::Datadog { .. } => "datadog",
            SinkDescriptor::Hosted(_) => "circonus",
        }
    }

    pub fn is_external(&self) -> bool {
        !matches!(self, SinkDescriptor::Inmem { .. })
    }

    /// Construct the sink this descriptor names.
    fn build(&self) -> Result<BuiltSink, TelemetryError> {
        match self {
            SinkDescriptor::Inmem { interval, retention } => {
                Ok(BuiltSink::Inmem(InmemSink::new(*interval, *retention)))
            }
            SinkDescriptor::Statsite { address } => {
                line_sink(LineProtocol::Statsite, "statsite", address)
            }
            SinkDescriptor::Statsd { address } => line_sink(LineProtocol::Statsd, "statsd", address),
            SinkDescriptor::Datadog { address, tags } => line_sink(
                LineProtocol::Datadog {
                    tags: Arc::new(tags.clone()),
                },
                "datadog",
                address,
            ),
            SinkDescriptor::Prometheus => {
                let recorder = PrometheusBuilder::new().build_recorder();
                let handle = recorder.handle();
                Ok(BuiltSink::Prometheus(Box::new(recorder), handle))
            }
            SinkDescriptor::Hosted(settings) => hosted_sink(settings),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

fn parse_duration(
    field: &'static str,
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, TelemetryError> {
    match raw {
        None | Some("") => Ok(default),
        Some(raw) => humantime::parse_duration(raw).map_err(|e| TelemetryError::Invalid {
            field,
            reason: e.to_string(),
        }),
    }
}

enum BuiltSink {
    Inmem(InmemSink),
    Line(LineRecorder, LineFlusher),
    Prometheus(Box<dyn Recorder + Send + Sync>, PrometheusHandle),
    Hosted(InmemSink, HostedFlusher),
}

/// Handles kept after installation.
#[derive(Clone)]
pub struct TelemetryHandles {
    pub inmem: InmemSink,
    pub prometheus: Option<PrometheusHandle>,
    /// Names of the constructed sinks, in construction order.
    pub sinks: Vec<&'static str>,
    pub hostname_label: bool,
    pub installed: bool,
}

impl TelemetryHandles {
    /// Handles with only an in-memory sink and nothing installed.
    pub fn detached() -> Self {
        Self {
            inmem: InmemSink::new(DEFAULT_INTERVAL, DEFAULT_RETENTION),
            prometheus: None,
            sinks: vec!["inmem"],
            hostname_label: false,
            installed: false,
        }
    }
}

/// A fully constructed, not yet installed, telemetry stack.
pub struct Telemetry {
    recorder: FilteredRecorder<FanoutRecorder>,
    handles: TelemetryHandles,
    flushers: Vec<Flusher>,
}

enum Flusher {
    Line(LineFlusher),
    Hosted(HostedFlusher),
    PrometheusUpkeep(PrometheusHandle),
}

/// Build every configured sink, or fail without leaving any behind.
pub fn build_sinks(telemetry: &TelemetryConfig, hostname: &str) -> Result<Telemetry, TelemetryError> {
    let descriptors = SinkDescriptor::from_telemetry(telemetry)?;

    let mut built = Vec::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        built.push(descriptor.build()?);
    }

    let external = descriptors.iter().any(SinkDescriptor::is_external);
    let hostname_label = external && !telemetry.disable_hostname.unwrap_or(false);

    let mut recorders: Vec<Box<dyn Recorder + Send + Sync>> = Vec::new();
    let mut flushers = Vec::new();
    let mut inmem = None;
    let mut prometheus = None;
    for sink in built {
        match sink {
            BuiltSink::Inmem(sink) => {
                recorders.push(Box::new(sink.clone()));
                inmem = Some(sink);
            }
            BuiltSink::Line(recorder, flusher) => {
                recorders.push(Box::new(recorder));
                flushers.push(Flusher::Line(flusher));
            }
            BuiltSink::Prometheus(recorder, handle) => {
                recorders.push(recorder);
                flushers.push(Flusher::PrometheusUpkeep(handle.clone()));
                prometheus = Some(handle);
            }
            BuiltSink::Hosted(sink, flusher) => {
                recorders.push(Box::new(sink));
                flushers.push(Flusher::Hosted(flusher));
            }
        }
    }
    let inmem = inmem.unwrap_or_else(|| InmemSink::new(DEFAULT_INTERVAL, DEFAULT_RETENTION));

    let filter = PrefixFilter::new(
        &telemetry.prefix_filter,
        telemetry.filter_default.unwrap_or(true),
    );
    let host = hostname_label.then(|| hostname.to_string());

    Ok(Telemetry {
        recorder: FilteredRecorder::new(FanoutRecorder::new(recorders), filter, host),
        handles: TelemetryHandles {
            inmem,
            prometheus,
            sinks: descriptors.iter().map(SinkDescriptor::name).collect(),
            hostname_label,
            installed: false,
        },
        flushers,
    })
}

impl Telemetry {
    pub fn handles(&self) -> &TelemetryHandles {
        &self.handles
    }

    pub fn recorder(&self) -> &FilteredRecorder<FanoutRecorder> {
        &self.recorder
    }

    /// Set the global recorder and start background flushers.
    ///
    /// If a recorder is already installed the new stack is dropped, a warning
    /// is logged, and the returned handles report `installed == false`.
    pub fn install(self) -> TelemetryHandles {
        let Telemetry {
            recorder,
            mut handles,
            flushers,
        } = self;

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already installed, keeping the existing one");
            return handles;
        }

        for flusher in flushers {
            match flusher {
                Flusher::Line(f) => {
                    tokio::spawn(f.run());
                }
                Flusher::Hosted(f) => {
                    tokio::spawn(f.run());
                }
                Flusher::PrometheusUpkeep(handle) => {
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(PROMETHEUS_UPKEEP);
                        loop {
                            ticker.tick().await;
                            handle.run_upkeep();
                        }
                    });
                }
            }
        }

        tracing::info!(sinks = ?handles.sinks, hostname_label = handles.hostname_label, "Telemetry installed");
        handles.installed = true;
        handles
    }
}

/// Best-effort local hostname.
pub fn system_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone)]
enum LineProtocol {
    Statsd,
    Statsite,
    Datadog { tags: Arc<Vec<String>> },
}

fn line_sink(
    protocol: LineProtocol,
    sink: &'static str,
    address: &str,
) -> Result<BuiltSink, TelemetryError> {
    let resolve_err = |reason: String| TelemetryError::Address {
        sink,
        address: address.to_string(),
        reason,
    };
    let target = address
        .to_socket_addrs()
        .map_err(|e| resolve_err(e.to_string()))?
        .next()
        .ok_or_else(|| resolve_err("no addresses".to_string()))?;

    let (tx, rx) = mpsc::channel(LINE_QUEUE);
    Ok(BuiltSink::Line(
        LineRecorder {
            protocol: protocol.clone(),
            tx,
        },
        LineFlusher {
            protocol,
            target,
            rx,
        },
    ))
}

/// Formats metrics as statsd-style lines.
struct LineRecorder {
    protocol: LineProtocol,
    tx: mpsc::Sender<String>,
}

struct LineHandle {
    name: String,
    suffix: String,
    tx: mpsc::Sender<String>,
}

impl LineHandle {
    /// Never blocks: a full queue drops the line.
    fn send(&self, value: impl std::fmt::Display, kind: &str) {
        let _ = self
            .tx
            .try_send(format!("{}:{}|{}{}", self.name, value, kind, self.suffix));
    }
}

impl LineRecorder {
    fn handle(&self, key: &Key) -> Arc<LineHandle> {
        let sanitize = |s: &str| s.replace([':', '|', ' ', ','], "_");
        let (name, suffix) = match &self.protocol {
            LineProtocol::Statsd | LineProtocol::Statsite => {
                let mut name = sanitize(key.name());
                for label in key.labels() {
                    name.push('.');
                    name.push_str(&sanitize(label.value()));
                }
                (name, String::new())
            }
            LineProtocol::Datadog { tags } => {
                let mut all: Vec<String> = tags.iter().cloned().collect();
                all.extend(
                    key.labels()
                        .map(|l| format!("{}:{}", sanitize(l.key()), sanitize(l.value()))),
                );
                let suffix = if all.is_empty() {
                    String::new()
                } else {
                    format!("|#{}", all.join(","))
                };
                (sanitize(key.name()), suffix)
            }
        };
        Arc::new(LineHandle {
            name,
            suffix,
            tx: self.tx.clone(),
        })
    }
}

impl CounterFn for LineHandle {
    fn increment(&self, value: u64) {
        self.send(value, "c");
    }

    fn absolute(&self, value: u64) {
        self.send(value, "g");
    }
}

impl GaugeFn for LineHandle {
    fn increment(&self, value: f64) {
        self.send(format_args!("+{}", value), "g");
    }

    fn decrement(&self, value: f64) {
        self.send(format_args!("-{}", value), "g");
    }

    fn set(&self, value: f64) {
        self.send(value, "g");
    }
}

impl HistogramFn for LineHandle {
    fn record(&self, value: f64) {
        self.send(value, "ms");
    }
}

impl Recorder for LineRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.handle(key))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key))
    }
}

/// Ships formatted lines: UDP for statsd and datadog, TCP for statsite.
struct LineFlusher {
    protocol: LineProtocol,
    target: SocketAddr,
    rx: mpsc::Receiver<String>,
}

/// Exponential reconnect backoff for the statsite stream.
#[derive(Debug)]
struct Reconnect {
    delay: Duration,
    retry_at: Option<Instant>,
}

impl Reconnect {
    fn new() -> Self {
        Self {
            delay: RECONNECT_MIN,
            retry_at: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    fn failed(&mut self, now: Instant) {
        self.retry_at = Some(now + self.delay);
        self.delay = (self.delay * 2).min(RECONNECT_MAX);
    }

    fn connected(&mut self) {
        *self = Self::new();
    }
}

impl LineFlusher {
    async fn run(mut self) {
        match self.protocol {
            LineProtocol::Statsite => self.run_tcp().await,
            _ => self.run_udp().await,
        }
    }

    async fn run_udp(&mut self) {
        let bind: SocketAddr = if self.target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = match tokio::net::UdpSocket::bind(bind).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open metrics socket");
                return;
            }
        };
        while let Some(line) = self.rx.recv().await {
            if let Err(e) = socket.send_to(line.as_bytes(), self.target).await {
                tracing::debug!(target_addr = %self.target, error = %e, "Dropped metric line");
            }
        }
    }

    async fn run_tcp(&mut self) {
        let mut stream: Option<tokio::net::TcpStream> = None;
        let mut reconnect = Reconnect::new();
        while let Some(mut line) = self.rx.recv().await {
            line.push('\n');
            if stream.is_none() {
                let now = Instant::now();
                if !reconnect.ready(now) {
                    continue;
                }
                let connect = tokio::net::TcpStream::connect(self.target);
                match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                    Ok(Ok(s)) => {
                        reconnect.connected();
                        stream = Some(s);
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(target_addr = %self.target, error = %e, "Statsite unreachable");
                        reconnect.failed(now);
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(target_addr = %self.target, "Statsite connect timed out");
                        reconnect.failed(now);
                        continue;
                    }
                }
            }
            if let Some(s) = stream.as_mut() {
                if s.write_all(line.as_bytes()).await.is_err() {
                    stream = None;
                }
            }
        }
    }
}

fn hosted_sink(settings: &HostedSettings) -> Result<BuiltSink, TelemetryError> {
    let endpoint = match &settings.submission_url {
        Some(url) => Url::parse(url)
            .map_err(|e| TelemetryError::Hosted(format!("invalid submission url {:?}: {}", url, e)))?,
        None => {
            let api = settings.api_url.as_deref().unwrap_or(DEFAULT_HOSTED_API);
            let base = Url::parse(api)
                .map_err(|e| TelemetryError::Hosted(format!("invalid api url {:?}: {}", api, e)))?;
            let check = settings.check_id.as_deref().unwrap_or("default");
            base.join(&format!("check_bundle/{}/metrics", check))
                .map_err(|e| TelemetryError::Hosted(e.to_string()))?
        }
    };
    if settings.submission_url.is_none() && settings.api_token.is_none() {
        return Err(TelemetryError::Hosted(
            "an api token or submission url is required".to_string(),
        ));
    }

    let sink = InmemSink::new(
        settings.submission_interval,
        settings.submission_interval.saturating_mul(2),
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| TelemetryError::Hosted(e.to_string()))?;

    Ok(BuiltSink::Hosted(
        sink.clone(),
        HostedFlusher {
            sink,
            endpoint,
            client,
            settings: settings.clone(),
        },
    ))
}

/// Periodically submits the latest in-memory interval.
struct HostedFlusher {
    sink: InmemSink,
    endpoint: Url,
    client: reqwest::Client,
    settings: HostedSettings,
}

impl HostedFlusher {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.settings.submission_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(latest) = self.sink.latest() else {
                continue;
            };

            let mut request = self.client.post(self.endpoint.clone()).json(&latest);
            if let Some(token) = &self.settings.api_token {
                request = request.header("X-Circonus-Auth-Token", token);
            }
            if let Some(app) = &self.settings.api_app {
                request = request.header("X-Circonus-App-Name", app);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => tracing::warn!(status = %resp.status(), "Hosted metrics submission rejected"),
                Err(e) => tracing::warn!(error = %e, "Hosted metrics submission failed"),
            }
        }
    }
}
