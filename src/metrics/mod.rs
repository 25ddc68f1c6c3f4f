//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and tips
//! - Verification outcomes and payouts sent
//! - Final payout states and co-sign votes
//! - Queue pressure and admin activity

use crate::error::{RouterError, RouterResult};

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "swap_router_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_PAUSED: GaugeVec = register_gauge_vec!(
        "swap_router_chain_paused",
        "Chain pause status set by operators (1=paused, 0=active)",
        &["chain_id"]
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS_VERIFIED: CounterVec = register_counter_vec!(
        "swap_router_swaps_verified_total",
        "Verification outcomes by source chain and record status",
        &["chain_id", "status"]
    ).unwrap();

    pub static ref PAYOUTS_SENT: CounterVec = register_counter_vec!(
        "swap_router_payouts_sent_total",
        "Payouts signed and handed to the sender",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref RESULTS_FINAL: CounterVec = register_counter_vec!(
        "swap_router_results_final_total",
        "Payouts reaching a final state",
        &["chain_id", "status"]
    ).unwrap();

    // MPC metrics
    pub static ref ACCEPT_VOTES: CounterVec = register_counter_vec!(
        "swap_router_accept_votes_total",
        "Decisions on co-sign requests",
        &["result"]
    ).unwrap();

    // Engine metrics
    pub static ref QUEUE_DROPS: CounterVec = register_counter_vec!(
        "swap_router_queue_drops_total",
        "Tasks dropped because a per-chain queue was full",
        &["queue", "chain_id"]
    ).unwrap();

    pub static ref ADMIN_CALLS: CounterVec = register_counter_vec!(
        "swap_router_admin_calls_total",
        "Admin calls by method and outcome",
        &["method", "outcome"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_router_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_router_health_check_failure_total",
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

    pub async fn run(&self) -> RouterResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RouterError::Internal(format!("bind metrics {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RouterError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    render()
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_paused(chain_id: u64, paused: bool) {
    CHAIN_PAUSED
        .with_label_values(&[&chain_id.to_string()])
        .set(if paused { 1.0 } else { 0.0 });
}

pub fn record_swap_verified(chain_id: u64, status: &str) {
    SWAPS_VERIFIED
        .with_label_values(&[&chain_id.to_string(), status])
        .inc();
}

pub fn record_payout_sent(chain_id: u64, kind: &str) {
    PAYOUTS_SENT
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_result_final(chain_id: u64, status: &str) {
    RESULTS_FINAL
        .with_label_values(&[&chain_id.to_string(), status])
        .inc();
}

pub fn record_accept_vote(result: &str) {
    ACCEPT_VOTES.with_label_values(&[result]).inc();
}

pub fn record_queue_drop(queue: &str, chain_id: u64) {
    QUEUE_DROPS
        .with_label_values(&[queue, &chain_id.to_string()])
        .inc();
}

pub fn record_admin_call(method: &str, ok: bool) {
    ADMIN_CALLS
        .with_label_values(&[method, if ok { "success" } else { "error" }])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
