//! Event-log client
//!
//! Runs the delivery client for the points listed in the configuration and
//! serves `/metrics`, `/health` and `/status`. Alarm transitions are read from
//! stdin, one per line: `NAME SEVERITY STATUS [VALUE]`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use el_common::{AlarmState, AlarmStatus, CapturedValue, Severity, ValueKind};
use el_config::ClientConfig;
use el_delivery::{
    EventLogClient, SourceSnapshot, StaticValueSource, StatusReport, SystemLogLayer,
    SystemLogSink, ValueSource,
};

/// Event-log delivery client
#[derive(Parser, Debug)]
#[command(name = "el-client")]
#[command(about = "Delivers alarm transitions to event-log collector servers")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "EL_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics and status server port
    #[arg(long, env = "EL_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Seconds to wait for each task during shutdown
    #[arg(long, env = "EL_SHUTDOWN_TIMEOUT_SECS", default_value = "5")]
    shutdown_timeout_secs: u64,

    /// Do not read transitions from stdin
    #[arg(long, env = "EL_NO_STDIN", default_value = "false")]
    no_stdin: bool,
}

#[derive(Clone)]
struct AppState {
    client: Arc<EventLogClient>,
    prometheus: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let sink = SystemLogSink::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(SystemLogLayer::new(sink.clone()))
        .init();

    info!("Starting event-log client");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let config = ClientConfig::load(args.config.as_deref())?;
    let values = Arc::new(StaticValueSource::from_points(&config.points));
    let client = Arc::new(EventLogClient::new(config, values.clone())?);
    sink.attach(client.system_log().clone());

    if let Err(e) = client.start().await {
        error!(error = %e, "Failed to start event-log client");
        return Err(e.into());
    }
    log_startup_summary(&client.report());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Metrics and status server
    let state = AppState {
        client: client.clone(),
        prometheus,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let http_addr = format!("0.0.0.0:{}", args.metrics_port);
    let listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind {http_addr}"))?;
    info!(address = %http_addr, "Metrics server listening");

    let http_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = axum::serve(listener, app) => {
                    if let Err(e) = result {
                        error!(error = %e, "Metrics server error");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Metrics server shutting down");
                }
            }
        })
    };

    let input_handle = if args.no_stdin {
        None
    } else {
        let client = client.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(read_transitions(client, values, shutdown_rx)))
    };

    info!("Event-log client running. Press Ctrl+C to shutdown.");
    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    let _ = shutdown_tx.send(());
    sink.detach();
    client
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        if let Some(handle) = input_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Event-log client shutdown complete");
    Ok(())
}

fn log_startup_summary(report: &StatusReport) {
    info!("=== Event-Log Client Startup Summary ===");
    for destination in &report.destinations {
        info!("  Destination: {}", destination.address);
    }
    info!("  Message port: {}, command port: {}", report.message_port, report.command_port);
    info!(
        "  Ring: {} slots ({} base, {} extension)",
        report.ring.stats.size, report.ring.stats.base, report.ring.stats.extension
    );
    info!("  Sender workers: {}", report.senders.workers);
    info!("========================================");
}

// ============================================================================
// HTTP handlers
// ============================================================================

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let report = state.client.report();
    let status = if !report.running {
        "DOWN"
    } else if report.selected().is_some() {
        "UP"
    } else {
        "DEGRADED"
    };
    let code = if report.running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": status,
            "version": report.version,
            "destinations_online": report.online_count(),
            "pending": report.ring.stats.pending,
        })),
    )
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.client.report())
}

// ============================================================================
// Producer input
// ============================================================================

#[derive(Debug, PartialEq)]
struct Transition<'a> {
    name: &'a str,
    state: AlarmState,
    value: Option<&'a str>,
}

fn parse_transition(line: &str) -> Result<Transition<'_>> {
    let mut parts = line.split_whitespace();
    let name = parts.next().context("missing point name")?;
    let severity = parts.next().context("missing severity")?;
    let status = parts.next().context("missing status")?;
    let value = parts.next();

    let severity =
        Severity::from_name(severity).with_context(|| format!("unknown severity {severity}"))?;
    let status =
        AlarmStatus::from_name(status).with_context(|| format!("unknown status {status}"))?;

    Ok(Transition {
        name,
        state: AlarmState::new(severity, status),
        value,
    })
}

fn parse_value(kind: ValueKind, text: &str) -> Option<CapturedValue> {
    let value = match kind {
        ValueKind::None => CapturedValue::none(),
        ValueKind::Float => CapturedValue::float(text.parse().ok()?),
        ValueKind::Double => CapturedValue::double(text.parse().ok()?),
        ValueKind::String => CapturedValue::string(text),
        ValueKind::Char => CapturedValue::char(text.parse().ok()?),
        ValueKind::UChar => CapturedValue::uchar(text.parse().ok()?),
        ValueKind::Short => CapturedValue::short(text.parse().ok()?),
        ValueKind::UShort => CapturedValue::ushort(text.parse().ok()?),
        ValueKind::Long => CapturedValue::long(text.parse().ok()?),
        ValueKind::ULong => CapturedValue::ulong(text.parse().ok()?),
        ValueKind::Enum => CapturedValue::enumerated(text.parse().ok()?),
    };
    Some(value)
}

fn apply_transition(client: &EventLogClient, values: &StaticValueSource, line: &str) -> Result<()> {
    let transition = parse_transition(line)?;
    let source = values
        .find(transition.name)
        .with_context(|| format!("unknown point {}", transition.name))?;
    let previous = values
        .snapshot(&source)
        .with_context(|| format!("no snapshot for {}", transition.name))?;

    let value = match transition.value {
        Some(text) => parse_value(previous.value.kind(), text)
            .with_context(|| format!("bad value {text} for {}", transition.name))?,
        None => previous.value,
    };

    values.update(transition.name, SourceSnapshot::new(value, transition.state));
    if previous.state != transition.state {
        let outcome =
            client
                .alarm_log()
                .log_transition(source, value, previous.state, transition.state, Utc::now());
        debug!(point = transition.name, outcome = ?outcome, "Transition logged");
    }
    Ok(())
}

/// Stdin is read on a plain thread; a blocking read cannot be cancelled and
/// would otherwise hold up runtime shutdown.
async fn read_transitions(
    client: Arc<EventLogClient>,
    values: Arc<StaticValueSource>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Err(e) = apply_transition(&client, &values, line) {
                        warn!(line, error = %e, "Ignoring input line");
                    }
                }
                None => {
                    debug!("Input closed");
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transition() {
        let t = parse_transition("TANK:LEVEL major hihi 97.5").unwrap();
        assert_eq!(t.name, "TANK:LEVEL");
        assert_eq!(t.state, AlarmState::new(Severity::Major, AlarmStatus::HiHi));
        assert_eq!(t.value, Some("97.5"));

        let t = parse_transition("TANK:LEVEL NO_ALARM NO_ALARM").unwrap();
        assert_eq!(t.state, AlarmState::normal());
        assert_eq!(t.value, None);
    }

    #[test]
    fn test_parse_transition_rejects_bad_lines() {
        assert!(parse_transition("").is_err());
        assert!(parse_transition("TANK:LEVEL MAJOR").is_err());
        assert!(parse_transition("TANK:LEVEL SEVERE HIHI").is_err());
        assert!(parse_transition("TANK:LEVEL MAJOR WOBBLY").is_err());
    }

    #[test]
    fn test_parse_value_by_kind() {
        assert_eq!(parse_value(ValueKind::Double, "1.5"), Some(CapturedValue::double(1.5)));
        assert_eq!(parse_value(ValueKind::UShort, "65535"), Some(CapturedValue::ushort(65535)));
        assert_eq!(parse_value(ValueKind::UShort, "65536"), None);
        assert_eq!(parse_value(ValueKind::Enum, "2"), Some(CapturedValue::enumerated(2)));
        assert_eq!(parse_value(ValueKind::Long, "x"), None);
    }
}
