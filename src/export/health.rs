use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::host::tracefs::TraceCountersSnapshot;
use crate::power::stats::StatsSnapshot;

const NAMESPACE: &str = "powertrace";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "powertrace" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Power events received by probe.
    pub events_by_probe: CounterVec,
    /// Samples written to the trace buffer by emission path.
    pub samples_by_path: CounterVec,
    /// Idle events equal to the cached state.
    pub idle_duplicates: Counter,
    /// Idle transitions recorded without emission.
    pub idle_unreported: Counter,
    /// Idle events for cores beyond the idle cache.
    pub idle_out_of_range: Counter,
    /// Samples dropped because the trace buffer was full.
    pub samples_dropped: Counter,
    /// Completed resync sweeps.
    pub resync_ticks: Counter,
    /// Time spent in resync sweeps.
    pub resync_duration: Counter,
    /// Cores currently online.
    pub cores_online: Gauge,
    /// Whether the power tracer is running (1=yes, 0=no).
    pub tracer_running: Gauge,
    /// trace_pipe lines read.
    pub trace_lines: Counter,
    /// trace_pipe lines that failed to parse.
    pub trace_parse_errors: Counter,
    /// Events the kernel reported as lost.
    pub trace_lost_events: Counter,
    /// Agent startup duration by phase.
    pub agent_start_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_by_probe = CounterVec::new(
            Opts::new("events_total", "Power events received by probe.").namespace(NAMESPACE),
            &["probe"],
        )?;
        let samples_by_path = CounterVec::new(
            Opts::new("samples_total", "Samples emitted by emission path.").namespace(NAMESPACE),
            &["path"],
        )?;
        let idle_duplicates = Counter::with_opts(
            Opts::new(
                "idle_duplicates_total",
                "Idle events equal to the cached state.",
            )
            .namespace(NAMESPACE),
        )?;
        let idle_unreported = Counter::with_opts(
            Opts::new(
                "idle_unreported_total",
                "Idle transitions recorded without emission.",
            )
            .namespace(NAMESPACE),
        )?;
        let idle_out_of_range = Counter::with_opts(
            Opts::new(
                "idle_out_of_range_total",
                "Idle events for cores beyond the idle cache.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_dropped = Counter::with_opts(
            Opts::new(
                "samples_dropped_total",
                "Samples dropped because the trace buffer was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let resync_ticks = Counter::with_opts(
            Opts::new("resync_ticks_total", "Completed resync sweeps.").namespace(NAMESPACE),
        )?;
        let resync_duration = Counter::with_opts(
            Opts::new(
                "resync_duration_seconds_total",
                "Time spent in resync sweeps.",
            )
            .namespace(NAMESPACE),
        )?;
        let cores_online = Gauge::with_opts(
            Opts::new("cores_online", "Cores currently online.").namespace(NAMESPACE),
        )?;
        let tracer_running = Gauge::with_opts(
            Opts::new(
                "tracer_running",
                "Whether the power tracer is running (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let trace_lines = Counter::with_opts(
            Opts::new("trace_lines_total", "trace_pipe lines read.").namespace(NAMESPACE),
        )?;
        let trace_parse_errors = Counter::with_opts(
            Opts::new(
                "trace_parse_errors_total",
                "trace_pipe lines that failed to parse.",
            )
            .namespace(NAMESPACE),
        )?;
        let trace_lost_events = Counter::with_opts(
            Opts::new(
                "trace_lost_events_total",
                "Events the kernel reported as lost.",
            )
            .namespace(NAMESPACE),
        )?;
        let agent_start_duration = GaugeVec::new(
            Opts::new(
                "agent_start_duration_seconds",
                "Agent startup duration by phase.",
            )
            .namespace(NAMESPACE),
            &["phase"],
        )?;

        registry.register(Box::new(events_by_probe.clone()))?;
        registry.register(Box::new(samples_by_path.clone()))?;
        registry.register(Box::new(idle_duplicates.clone()))?;
        registry.register(Box::new(idle_unreported.clone()))?;
        registry.register(Box::new(idle_out_of_range.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(resync_ticks.clone()))?;
        registry.register(Box::new(resync_duration.clone()))?;
        registry.register(Box::new(cores_online.clone()))?;
        registry.register(Box::new(tracer_running.clone()))?;
        registry.register(Box::new(trace_lines.clone()))?;
        registry.register(Box::new(trace_parse_errors.clone()))?;
        registry.register(Box::new(trace_lost_events.clone()))?;
        registry.register(Box::new(agent_start_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_by_probe,
            samples_by_path,
            idle_duplicates,
            idle_unreported,
            idle_out_of_range,
            samples_dropped,
            resync_ticks,
            resync_duration,
            cores_online,
            tracer_running,
            trace_lines,
            trace_parse_errors,
            trace_lost_events,
            agent_start_duration,
        })
    }

    /// Add a probe counter snapshot.
    pub fn record_probe_stats(&self, snap: &StatsSnapshot) {
        for (probe, count) in &snap.events {
            self.events_by_probe
                .with_label_values(&[probe.as_str()])
                .inc_by(*count as f64);
        }
        for (path, count) in &snap.emitted {
            self.samples_by_path
                .with_label_values(&[path.as_str()])
                .inc_by(*count as f64);
        }
        self.idle_duplicates.inc_by(snap.idle_duplicates as f64);
        self.idle_unreported.inc_by(snap.idle_unreported as f64);
        self.idle_out_of_range.inc_by(snap.idle_out_of_range as f64);
        self.resync_ticks.inc_by(snap.resync_ticks as f64);
        self.resync_duration.inc_by(snap.resync_ns as f64 / 1e9);
    }

    /// Add a trace reader counter snapshot.
    pub fn record_trace_counters(&self, snap: &TraceCountersSnapshot) {
        self.trace_lines.inc_by(snap.lines as f64);
        self.trace_parse_errors.inc_by(snap.parse_errors as f64);
        self.trace_lost_events.inc_by(snap.lost_events as f64);
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
