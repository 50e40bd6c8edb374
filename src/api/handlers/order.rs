//! Order handlers: place, cancel, status, pre-trade validation.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CancelOrderRequest, OrderStatusResponse, PlaceOrderRequest, PlaceOrderResponse,
    ValidateOrderRequest,
};
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

/// POST /orders
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<Json<ApiResponse<PlaceOrderResponse>>, AppError> {
    req.validate()?;
    let response = state.market.place_order(req).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// DELETE /orders/:order_id
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    state.market.cancel_order(order_id, req.investor).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "order_id": order_id,
        "canceled": true,
    }))))
}

/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderStatusResponse>>, AppError> {
    let status = state.market.order_status(order_id).await?;
    Ok(Json(ApiResponse::success(status)))
}

/// POST /orders/validate
///
/// Pre-trade check only; never mutates.
pub async fn validate_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateOrderRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    state
        .portfolio
        .validate_order(req.investor, &req.symbol, req.side, req.qty, req.price)
        .await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "valid": true,
    }))))
}
