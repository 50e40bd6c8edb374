//! Price handlers: quotes, history, direct updates, stock creation.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use crate::models::{
    InitializeStockRequest, PriceHistoryQuery, PricePoint, Stock, UpdatePriceRequest,
};
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

/// GET /prices
pub async fn get_prices(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Stock>>> {
    Json(ApiResponse::success(state.price.get_prices().await))
}

/// GET /prices/:symbol
pub async fn get_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Stock>>, AppError> {
    let stock = state.price.get_price(&symbol.to_uppercase()).await?;
    Ok(Json(ApiResponse::success(stock)))
}

/// GET /prices/:symbol/history
pub async fn get_price_history(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PriceHistoryQuery>,
) -> Result<Json<ApiResponse<Vec<PricePoint>>>, AppError> {
    let history = state.price.history(&symbol.to_uppercase(), &query).await?;
    Ok(Json(ApiResponse::success(history)))
}

/// PUT /prices/:symbol
pub async fn update_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(req): Json<UpdatePriceRequest>,
) -> Result<Json<ApiResponse<Stock>>, AppError> {
    let stock = state
        .price
        .update_price(&symbol.to_uppercase(), req.price)
        .await?;
    Ok(Json(ApiResponse::success(stock)))
}

/// POST /stocks
pub async fn initialize_stock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitializeStockRequest>,
) -> Result<Json<ApiResponse<Stock>>, AppError> {
    let stock = state
        .price
        .initialize_stock(&req.symbol, req.price, req.name.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(stock)))
}
