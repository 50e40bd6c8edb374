use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // Orders
        .route("/orders", post(handlers::order::create_order))
        .route("/orders/validate", post(handlers::order::validate_order))
        .route("/orders/:order_id", get(handlers::order::get_order))
        .route("/orders/:order_id", delete(handlers::order::cancel_order))
        // Market
        .route("/markets/:symbol/orderbook", get(handlers::market::get_orderbook))
        .route("/market/state", get(handlers::market::get_market_state))
        .route("/market/state", put(handlers::market::set_market_state))
        // Prices
        .route("/prices", get(handlers::price::get_prices))
        .route("/prices/:symbol", get(handlers::price::get_price))
        .route("/prices/:symbol", put(handlers::price::update_price))
        .route("/prices/:symbol/history", get(handlers::price::get_price_history))
        .route("/stocks", post(handlers::price::initialize_stock))
        // Investors
        .route("/investors", post(handlers::investor::register))
        .route("/investors/:id", get(handlers::investor::get_investor))
        .route("/investors/:id/balance", post(handlers::investor::adjust_balance))
        .route("/investors/:id/portfolio", get(handlers::investor::get_portfolio))
        .route("/investors/:id/portfolio", post(handlers::investor::apply_trade))
        .route("/investors/:id/transactions", get(handlers::investor::get_transactions))
        // Analytics
        .route("/analytics/top-traded", get(handlers::analytics::top_traded))
        .route("/analytics/most-volatile", get(handlers::analytics::most_volatile))
        .route("/analytics/market-stats", get(handlers::analytics::market_stats))
        .route(
            "/analytics/investors/:id/performance",
            get(handlers::analytics::investor_performance),
        )
        .route("/analytics/predict/:symbol", get(handlers::analytics::predict_price))
        .route("/analytics/volume/:symbol", get(handlers::analytics::trading_volume))
        .route("/analytics/trades", post(handlers::analytics::record_trade))
        // Webhooks & events
        .route("/webhooks", post(handlers::webhook::create_webhook))
        .route("/webhooks", get(handlers::webhook::list_webhooks))
        .route("/webhooks/test", post(handlers::webhook::test_webhook))
        .route("/webhooks/:id", get(handlers::webhook::get_webhook))
        .route("/webhooks/:id", delete(handlers::webhook::delete_webhook))
        .route("/webhooks/:id", patch(handlers::webhook::patch_webhook))
        .route("/events", post(handlers::webhook::publish_event))
        .route("/events/types", get(handlers::webhook::event_types))
}
