//! Analytics handlers: rankings, stats, performance, prediction, volume.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    InvestorPerformance, MarketStats, PricePrediction, RecordTradeRequest, TopTradedEntry,
    TradeRecord, VolatilityEntry, VolumeBucket,
};
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub limit: Option<i64>,
    /// Window length in seconds; defaults to 24h.
    pub window_secs: Option<i64>,
}

impl WindowQuery {
    fn window(&self) -> Duration {
        Duration::seconds(self.window_secs.unwrap_or(86_400).clamp(1, 30 * 86_400))
    }

    fn limit(&self) -> i64 {
        self.limit.unwrap_or(10)
    }
}

/// GET /analytics/top-traded
pub async fn top_traded(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<TopTradedEntry>>>, AppError> {
    let entries = state
        .analytics
        .top_traded(query.limit(), query.window())
        .await?;
    Ok(Json(ApiResponse::success(entries)))
}

/// GET /analytics/most-volatile
pub async fn most_volatile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<VolatilityEntry>>>, AppError> {
    let entries = state
        .analytics
        .most_volatile(query.limit(), query.window())
        .await?;
    Ok(Json(ApiResponse::success(entries)))
}

/// GET /analytics/market-stats
pub async fn market_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<MarketStats>>, AppError> {
    Ok(Json(ApiResponse::success(state.analytics.market_stats().await?)))
}

/// GET /analytics/investors/:id/performance
pub async fn investor_performance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InvestorPerformance>>, AppError> {
    let quotes = state.price.quote_map().await;
    let performance = state.analytics.investor_performance(id, &quotes).await?;
    Ok(Json(ApiResponse::success(performance)))
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub horizon_min: Option<i64>,
}

/// GET /analytics/predict/:symbol
pub async fn predict_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PredictQuery>,
) -> Result<Json<ApiResponse<PricePrediction>>, AppError> {
    let horizon = query.horizon_min.unwrap_or(60).clamp(1, 24 * 60);
    let prediction = state
        .analytics
        .predict_price(&symbol.to_uppercase(), horizon)
        .await?;
    Ok(Json(ApiResponse::success(prediction)))
}

#[derive(Debug, Deserialize)]
pub struct VolumeQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub interval_ms: Option<i64>,
}

/// GET /analytics/volume/:symbol
pub async fn trading_volume(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<VolumeQuery>,
) -> Result<Json<ApiResponse<Vec<VolumeBucket>>>, AppError> {
    let buckets = state
        .analytics
        .trading_volume(
            &symbol.to_uppercase(),
            query.start.and_then(DateTime::from_timestamp_millis),
            query.end.and_then(DateTime::from_timestamp_millis),
            query.interval_ms.unwrap_or(60_000),
        )
        .await?;
    Ok(Json(ApiResponse::success(buckets)))
}

/// POST /analytics/trades
pub async fn record_trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordTradeRequest>,
) -> Result<Json<ApiResponse<TradeRecord>>, AppError> {
    if req.qty <= 0 {
        return Err(AppError::bad_request("qty must be positive"));
    }
    let record: TradeRecord = req.into();
    state.analytics.record_trade(&record).await?;
    Ok(Json(ApiResponse::success(record)))
}
