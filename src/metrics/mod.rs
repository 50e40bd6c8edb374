//! Metrics for the trading core.
//!
//! Prometheus-compatible metrics for monitoring:
//! - Matching engine (orders, executions, match latency)
//! - Settlement (settled, failed, retries)
//! - Event bus (published, dropped subscribers)
//! - Webhook delivery (attempts, failures)
//! - WebSocket streaming (connections)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency
pub mod names {
    // Matching Engine Metrics
    pub const ORDERS_PLACED_TOTAL: &str = "orders_placed_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELED_TOTAL: &str = "orders_canceled_total";
    pub const EXECUTIONS_TOTAL: &str = "executions_total";
    pub const ORDER_MATCH_DURATION_SECONDS: &str = "order_match_duration_seconds";

    // Settlement Metrics
    pub const SETTLEMENTS_TOTAL: &str = "settlements_total";
    pub const SETTLEMENT_FAILURES_TOTAL: &str = "settlement_failures_total";
    pub const SETTLEMENT_RETRIES_TOTAL: &str = "settlement_retries_total";

    // Event Bus Metrics
    pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
    pub const EVENT_SUBSCRIBERS_DROPPED_TOTAL: &str = "event_subscribers_dropped_total";

    // Webhook Metrics
    pub const WEBHOOK_DELIVERIES_TOTAL: &str = "webhook_deliveries_total";
    pub const WEBHOOK_FAILURES_TOTAL: &str = "webhook_failures_total";

    // WebSocket Metrics
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
}

/// Label keys
pub mod labels {
    pub const SYMBOL: &str = "symbol";
    pub const SIDE: &str = "side";
    pub const REASON: &str = "reason";
}

/// Initialize Prometheus metrics exporter
///
/// Returns a handle that can be used to render metrics
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new()
        // Order matching duration buckets (in seconds) - should be fast
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_MATCH_DURATION_SECONDS.to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
        )
        .expect("invalid histogram buckets");

    builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}
