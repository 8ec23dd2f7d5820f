//! Prometheus metrics registry and instruments.
//!
//! A backup run is a short-lived process, so nothing scrapes it. Instead
//! the registry is rendered to a text file at the end of each run for a
//! node-exporter textfile collector to pick up.

use std::path::Path;
use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

use crate::error::AppError;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("odoo_backup_runs_total", "Total number of backup runs by outcome"),
        &["status"]
    ).expect("metric can be created");
    pub static ref ARTIFACT_BYTES: Gauge = Gauge::new(
        "odoo_backup_artifact_bytes",
        "Size of the most recent backup artifact in bytes"
    ).expect("metric can be created");
    pub static ref STAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "odoo_backup_stage_duration_seconds",
            "Pipeline stage duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["stage"]
    ).expect("metric can be created");
    pub static ref PRUNED_FILES_TOTAL: IntCounter = IntCounter::new(
        "odoo_backup_pruned_files_total",
        "Total number of local files removed by retention"
    ).expect("metric can be created");
    pub static ref PRUNE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "odoo_backup_prune_failures_total",
        "Total number of local files retention failed to remove"
    ).expect("metric can be created");
    pub static ref LAST_SUCCESS_TIMESTAMP_SECONDS: Gauge = Gauge::new(
        "odoo_backup_last_success_timestamp_seconds",
        "Unix time of the last fully successful run"
    ).expect("metric can be created");
}

static REGISTER: Once = Once::new();

/// Initialize metrics registry. Later calls are no-ops.
pub fn init_metrics() {
    REGISTER.call_once(register_all);
}

fn register_all() {
    REGISTRY
        .register(Box::new(RUNS_TOTAL.clone()))
        .expect("RUNS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ARTIFACT_BYTES.clone()))
        .expect("ARTIFACT_BYTES can be registered");
    REGISTRY
        .register(Box::new(STAGE_DURATION_SECONDS.clone()))
        .expect("STAGE_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(PRUNED_FILES_TOTAL.clone()))
        .expect("PRUNED_FILES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(PRUNE_FAILURES_TOTAL.clone()))
        .expect("PRUNE_FAILURES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(LAST_SUCCESS_TIMESTAMP_SECONDS.clone()))
        .expect("LAST_SUCCESS_TIMESTAMP_SECONDS can be registered");

    tracing::debug!("Metrics registry initialized");
}

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String, AppError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| AppError::Internal(e.into()))
}

/// Write the text exposition to `path`
///
/// Written to a sibling temporary file first so the collector never
/// reads a half-written file.
pub fn write_textfile(path: &Path) -> Result<(), AppError> {
    use std::io::Write;

    let body = render()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| AppError::Storage(format!("Failed to create metrics file: {}", e)))?;
    file.write_all(body.as_bytes())
        .map_err(|e| AppError::Storage(format!("Failed to write metrics file: {}", e)))?;
    file.persist(path)
        .map_err(|e| AppError::Storage(format!("Failed to persist metrics file: {}", e)))?;

    tracing::debug!(path = %path.display(), "Metrics textfile written");
    Ok(())
}
