//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and balance read failures
//! - Bridge legs and arrival latency
//! - Settlement and swap outcomes

use crate::error::{EngineError, EngineResult};
use crate::types::ChainKey;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "settlement_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref BALANCE_READ_FAILURES: CounterVec = register_counter_vec!(
        "settlement_balance_read_failures_total",
        "Balance reads that failed and were counted as zero",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "settlement_transactions_submitted_total",
        "Total transactions submitted",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "settlement_transactions_failed_total",
        "Total transactions rejected or reverted",
        &["chain"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "settlement_transaction_confirmation_seconds",
        "Time from broadcast to receipt",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Bridge metrics
    pub static ref LEGS_SUBMITTED: CounterVec = register_counter_vec!(
        "settlement_bridge_legs_submitted_total",
        "Bridge deposits accepted on the source chain",
        &["chain"]
    ).unwrap();

    pub static ref LEGS_FAILED: CounterVec = register_counter_vec!(
        "settlement_bridge_legs_failed_total",
        "Bridge legs that failed during execution",
        &["chain"]
    ).unwrap();

    pub static ref LEGS_REJECTED: CounterVec = register_counter_vec!(
        "settlement_bridge_legs_rejected_total",
        "Candidate legs rejected during planning",
        &["chain", "reason"]
    ).unwrap();

    // Arrival metrics
    pub static ref ARRIVAL_LATENCY: HistogramVec = register_histogram_vec!(
        "settlement_arrival_seconds",
        "Time until bridged funds were observed on the settlement chain",
        &["chain"],
        vec![10.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0]
    ).unwrap();

    pub static ref ARRIVAL_TIMEOUTS: CounterVec = register_counter_vec!(
        "settlement_arrival_timeouts_total",
        "Arrival polls that exhausted their attempt budget",
        &["chain"]
    ).unwrap();

    // Outcome metrics
    pub static ref SETTLEMENTS: CounterVec = register_counter_vec!(
        "settlement_requests_total",
        "Settlement requests by kind and final status",
        &["kind", "status"]
    ).unwrap();

    pub static ref SWAPS: CounterVec = register_counter_vec!(
        "settlement_swaps_total",
        "Swap executions by status",
        &["status"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "settlement_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "settlement_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EngineError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainKey, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_balance_read_failure(chain: ChainKey) {
    BALANCE_READ_FAILURES
        .with_label_values(&[chain.as_str()])
        .inc();
}

pub fn record_tx_submitted(chain: ChainKey) {
    TX_SUBMITTED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_failed(chain: ChainKey) {
    TX_FAILED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_confirmed(chain: ChainKey, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[chain.as_str()])
        .observe(latency_secs);
}

pub fn record_leg_submitted(chain: ChainKey) {
    LEGS_SUBMITTED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_leg_failed(chain: ChainKey) {
    LEGS_FAILED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_leg_rejected(chain: ChainKey, reason: &str) {
    LEGS_REJECTED
        .with_label_values(&[chain.as_str(), reason])
        .inc();
}

pub fn record_arrival(chain: ChainKey, latency_secs: f64) {
    ARRIVAL_LATENCY
        .with_label_values(&[chain.as_str()])
        .observe(latency_secs);
}

pub fn record_arrival_timeout(chain: ChainKey) {
    ARRIVAL_TIMEOUTS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_settlement(kind: &str, status: &str) {
    SETTLEMENTS.with_label_values(&[kind, status]).inc();
}

pub fn record_swap(status: &str) {
    SWAPS.with_label_values(&[status]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_renders_recorded_series() {
        record_leg_rejected(ChainKey::Base, "amount_too_low");
        record_settlement("withdraw", "settled");

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("settlement_bridge_legs_rejected_total"));
        assert!(body.contains("reason=\"amount_too_low\""));
        assert!(body.contains("settlement_requests_total"));
    }
}
