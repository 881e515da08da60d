//! Core shared utilities for carsight services.

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use once_cell::sync::{Lazy, OnceCell};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use parking_lot::RwLock;
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static PROM_INIT: OnceCell<()> = OnceCell::new();
static METER_PROVIDER: Lazy<RwLock<Option<SdkMeterProvider>>> = Lazy::new(|| RwLock::new(None));

static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);
pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Environment prefix shared by every carsight service.
pub const ENV_PREFIX: &str = "CARSIGHT";

/// Installs the global tracing subscriber once per process.
///
/// `RUST_LOG` drives the filter (default `info`). Set `CARSIGHT_JSON_LOG=1` for
/// one JSON object per event.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let json = std::env::var("CARSIGHT_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        if json {
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_env_filter(env_filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .with_env_filter(env_filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;
        }
        Ok(())
    })?;
    info!(target: "carsight", service, "tracing initialized");
    Ok(())
}

/// Routes OpenTelemetry instruments into the Prometheus default registry.
pub fn init_metrics() -> Result<()> {
    PROM_INIT.get_or_try_init(|| -> Result<()> {
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(prometheus::default_registry().clone())
            .build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider.clone());
        *METER_PROVIDER.write() = Some(provider);
        Ok(())
    })?;
    Ok(())
}

pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.write().take() {
        if let Err(e) = provider.shutdown() { tracing::warn!(error=?e, "meter provider shutdown failed"); }
    }
}

pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async {
            let ready = NODE_READINESS.load(Ordering::SeqCst);
            let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            (status, axum::Json(serde_json::json!({"ready": ready})))
        }))
        .route("/metrics", get(metrics_handler))
}

/// Serves `/live`, `/ready` and `/metrics` on a background task.
pub async fn start_health_server(port: u16) -> Result<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr=?local, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await {
            tracing::error!(error=?e, "health server failed");
        }
    });
    Ok(local)
}

async fn metrics_handler() -> axum::response::Response {
    if PROM_INIT.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

/// Layers defaults, an optional file, an optional remote YAML document and the
/// `CARSIGHT__*` environment into `T`.
///
/// The file comes from `CARSIGHT_CONFIG_FILE`, the remote document from
/// `CARSIGHT_CONFIG_HTTP`. An unreachable remote source is logged and skipped.
pub async fn load_config<T: DeserializeOwned>(service: &str) -> Result<T> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?;

    if let Ok(file) = std::env::var("CARSIGHT_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    if let Ok(http_url) = std::env::var("CARSIGHT_CONFIG_HTTP") {
        match fetch_remote_config(&http_url).await {
            Ok(text) => { builder = builder.add_source(config::File::from_str(&text, config::FileFormat::Yaml)); }
            Err(e) => tracing::warn!(url=%http_url, error=?e, "remote config unavailable, skipping"),
        }
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

async fn fetch_remote_config(url: &str) -> Result<String> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    Ok(resp.text().await?)
}
