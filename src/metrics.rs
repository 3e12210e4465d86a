//! # Global Metrics Registry
//!
//! This module defines and registers all Prometheus metrics for the engine.
//! Metric handles are process-wide statics; the state they describe is owned by
//! the components that update them. An optional HTTP endpoint exposes them for
//! scraping.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};
use warp::{Filter, Reply};

// --- Node Pool Metrics ---
pub static NODE_HEALTH_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "sentinel_node_health_status",
        "Health of each RPC node (1 = healthy, 0 = unhealthy).",
        &["node", "chain"]
    )
    .expect("Failed to register sentinel_node_health_status")
});
pub static HEALTH_CHECKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_health_checks_total",
        "Health checks performed, labeled by outcome.",
        &["node", "outcome"]
    )
    .expect("Failed to register sentinel_health_checks_total")
});
pub static RPC_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_rpc_requests_total",
        "RPC requests routed through the load balancer.",
        &["node", "method", "outcome"]
    )
    .expect("Failed to register sentinel_rpc_requests_total")
});
pub static RPC_LATENCY_HISTOGRAM: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sentinel_rpc_latency_seconds",
        "Latency of RPC calls in seconds.",
        &["method"]
    )
    .expect("Failed to register sentinel_rpc_latency_seconds")
});
pub static RPC_FAILOVERS_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_rpc_failovers_total",
        "Requests retried on a different node.",
        &["method"]
    )
    .expect("Failed to register sentinel_rpc_failovers_total")
});

// --- Mempool Metrics ---
pub static MEMPOOL_WINDOW_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sentinel_mempool_window_size",
        "Pending transactions currently inside the tracking window."
    )
    .expect("Failed to register sentinel_mempool_window_size")
});
pub static OPTIMAL_GAS_PRICE_GWEI: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sentinel_optimal_gas_price_gwei",
        "Most recent optimal gas price recommendation, in gwei."
    )
    .expect("Failed to register sentinel_optimal_gas_price_gwei")
});
pub static CONGESTION_SCORE_PERMILLE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sentinel_congestion_score_permille",
        "Congestion score scaled to 0..=1000."
    )
    .expect("Failed to register sentinel_congestion_score_permille")
});
pub static ANALYSIS_CYCLES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_analysis_cycles_total",
        "Mempool analysis cycles, labeled by outcome.",
        &["outcome"]
    )
    .expect("Failed to register sentinel_analysis_cycles_total")
});

// --- Transaction Monitor Metrics ---
pub static TRACKED_TRANSACTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "sentinel_tracked_transactions",
        "Tracked transactions by status.",
        &["status"]
    )
    .expect("Failed to register sentinel_tracked_transactions")
});
pub static TRANSACTION_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_transaction_transitions_total",
        "Transaction status transitions.",
        &["from", "to"]
    )
    .expect("Failed to register sentinel_transaction_transitions_total")
});
pub static TRANSACTION_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_transaction_retries_total",
        "Resubmissions scheduled by the retry manager, labeled by outcome.",
        &["outcome"]
    )
    .expect("Failed to register sentinel_transaction_retries_total")
});
pub static CONFIRMATION_TIME_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sentinel_confirmation_time_seconds",
        "Time from submission to confirmation.",
        &["retried"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    )
    .expect("Failed to register sentinel_confirmation_time_seconds")
});
pub static ALERTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_alerts_total",
        "Alerts raised, labeled by type and severity.",
        &["alert_type", "severity"]
    )
    .expect("Failed to register sentinel_alerts_total")
});
pub static ALERT_DELIVERY_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sentinel_alert_delivery_failures_total",
        "Alert deliveries that failed, per channel.",
        &["channel"]
    )
    .expect("Failed to register sentinel_alert_delivery_failures_total")
});

/// Starts a Prometheus scrape endpoint on `/metrics`.
pub fn start_metrics_server(host: String, port: u16) -> eyre::Result<JoinHandle<()>> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| eyre::eyre!("Invalid metrics server address {}:{}: {}", host, port, e))?;

    Ok(tokio::spawn(async move {
        info!(target: "metrics", "Prometheus metrics server starting on http://{}", addr);
        let metrics_route = warp::path("metrics").and_then(metrics_handler);
        warp::serve(metrics_route).run(addr).await;
    }))
}

/// Encodes the default registry in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

async fn metrics_handler() -> Result<warp::reply::Response, warp::Rejection> {
    match render() {
        Ok(body) => Ok(warp::reply::with_header(body, "Content-Type", TextEncoder::new().format_type())
            .into_response()),
        Err(e) => {
            error!(target: "metrics", "Failed to encode metrics: {}", e);
            Ok(warp::reply::with_status(
                "Failed to encode metrics".to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_render_in_text_format() {
        NODE_HEALTH_STATUS.with_label_values(&["metrics-test", "ethereum"]).set(1);
        ALERTS_TOTAL.with_label_values(&["failed", "critical"]).inc();
        let body = render().unwrap();
        assert!(body.contains("sentinel_node_health_status"));
        assert!(body.contains("sentinel_alerts_total"));
    }
}
