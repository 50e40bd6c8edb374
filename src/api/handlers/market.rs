//! Market-level handlers: order book depth and the market state machine.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::OrderBookSnapshot;
use crate::services::market::MarketState;
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

/// GET /markets/:symbol/orderbook
pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<OrderBookSnapshot>>, AppError> {
    let snapshot = state.market.order_book(&symbol).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// GET /market/state
pub async fn get_market_state(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::success(serde_json::json!({
        "state": state.market.market_state(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetMarketStateRequest {
    pub state: MarketState,
}

/// PUT /market/state
pub async fn set_market_state(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetMarketStateRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let next = state.market.set_market_state(req.state).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "state": next,
    }))))
}
