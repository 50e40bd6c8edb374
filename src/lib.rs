//! Trading core of a distributed stock-market simulation.
//!
//! Five cooperating services over one shared SQLite store:
//! matching engine, settlement coordinator, price engine, portfolio
//! store, and analytics recorder, wired together by a bounded fan-out
//! event bus and fronted by an axum HTTP + WebSocket surface.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;
pub mod utils;
pub mod websocket;

use crate::config::AppConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::services::analytics::AnalyticsRecorder;
use crate::services::market::MarketService;
use crate::services::portfolio::PortfolioStore;
use crate::services::price::PriceEngine;
use crate::services::webhook::WebhookService;

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub bus: EventBus,
    pub market: Arc<MarketService>,
    pub price: Arc<PriceEngine>,
    pub portfolio: Arc<PortfolioStore>,
    pub analytics: Arc<AnalyticsRecorder>,
    pub webhooks: Arc<WebhookService>,
    pub metrics_handle: Option<PrometheusHandle>,
}
