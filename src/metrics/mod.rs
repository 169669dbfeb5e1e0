//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Latest observed block heights
//! - Verification outcomes
//! - Signing, broadcast and confirmation counts
//! - Worker error rates

use crate::error::BridgeResult;
use crate::store::Direction;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref CHAIN_LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "lattice_chain_latest_block",
        "Latest observed block height per chain role",
        &["role"]
    )
    .unwrap();

    pub static ref SWAPS_VERIFIED: CounterVec = register_counter_vec!(
        "lattice_swaps_verified_total",
        "Verification outcomes by direction",
        &["direction", "outcome"]
    )
    .unwrap();

    pub static ref SWAPS_SIGNED: CounterVec = register_counter_vec!(
        "lattice_swaps_signed_total",
        "Mirror transactions signed by the threshold group",
        &["direction"]
    )
    .unwrap();

    pub static ref TX_BROADCAST: CounterVec = register_counter_vec!(
        "lattice_tx_broadcast_total",
        "Mirror transactions broadcast",
        &["direction"]
    )
    .unwrap();

    pub static ref SWAPS_CONFIRMED: CounterVec = register_counter_vec!(
        "lattice_swaps_confirmed_total",
        "Mirror transactions confirmed stable",
        &["direction"]
    )
    .unwrap();

    pub static ref SWAPS_FAILED: CounterVec = register_counter_vec!(
        "lattice_swaps_failed_total",
        "Swaps failed after verification, by stage",
        &["direction", "stage"]
    )
    .unwrap();

    pub static ref WORKER_ERRORS: CounterVec = register_counter_vec!(
        "lattice_worker_errors_total",
        "Errors isolated inside worker loops",
        &["job"]
    )
    .unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::BridgeError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::BridgeError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_latest_block(is_src: bool, height: u64) {
    let role = if is_src { "src" } else { "dst" };
    CHAIN_LATEST_BLOCK
        .with_label_values(&[role])
        .set(height as f64);
}

pub fn record_verify_outcome(direction: Direction, outcome: &str) {
    SWAPS_VERIFIED
        .with_label_values(&[direction.as_str(), outcome])
        .inc();
}

pub fn record_swap_signed(direction: Direction) {
    SWAPS_SIGNED.with_label_values(&[direction.as_str()]).inc();
}

pub fn record_tx_broadcast(direction: Direction) {
    TX_BROADCAST.with_label_values(&[direction.as_str()]).inc();
}

pub fn record_swap_confirmed(direction: Direction) {
    SWAPS_CONFIRMED
        .with_label_values(&[direction.as_str()])
        .inc();
}

pub fn record_swap_failed(direction: Direction, stage: &str) {
    SWAPS_FAILED
        .with_label_values(&[direction.as_str(), stage])
        .inc();
}

pub fn record_worker_error(job: &str) {
    WORKER_ERRORS.with_label_values(&[job]).inc();
}
