//! Investor handlers: registration, balances, portfolio, history.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    AdjustBalanceRequest, ApplyTradeRequest, Investor, Portfolio, RegisterRequest, Transaction,
    TransactionQuery,
};
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

/// POST /investors
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<ApiResponse<Investor>>, AppError> {
    req.validate()?;
    let investor = state
        .portfolio
        .register(&req.name, &req.email, req.initial_balance)
        .await?;
    Ok(Json(ApiResponse::success(investor)))
}

/// GET /investors/:id
pub async fn get_investor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Investor>>, AppError> {
    Ok(Json(ApiResponse::success(state.portfolio.get(id).await?)))
}

/// POST /investors/:id/balance
pub async fn adjust_balance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdjustBalanceRequest>,
) -> Result<Json<ApiResponse<Investor>>, AppError> {
    let reason = req.reason.as_deref().unwrap_or("adjustment");
    let investor = state.portfolio.adjust_balance(id, req.amount, reason).await?;
    Ok(Json(ApiResponse::success(investor)))
}

/// GET /investors/:id/portfolio
pub async fn get_portfolio(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Portfolio>>, AppError> {
    let quotes = state.price.quote_map().await;
    let portfolio = state.portfolio.portfolio(id, &quotes).await?;
    Ok(Json(ApiResponse::success(portfolio)))
}

/// POST /investors/:id/portfolio
///
/// Direct holding mutation (the `UpdatePortfolio` surface). Trading goes
/// through `POST /orders`; this exists for seeding and corrections.
pub async fn apply_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApplyTradeRequest>,
) -> Result<Json<ApiResponse<Transaction>>, AppError> {
    if req.investor != id {
        return Err(AppError::bad_request("body investor does not match path"));
    }
    let record = state
        .portfolio
        .apply_trade(req.investor, &req.symbol, req.qty, req.price, req.tx_id)
        .await?;
    Ok(Json(ApiResponse::success(record)))
}

/// GET /investors/:id/transactions
pub async fn get_transactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<ApiResponse<Vec<Transaction>>>, AppError> {
    let transactions = state.portfolio.transactions(id, &query).await?;
    Ok(Json(ApiResponse::success(transactions)))
}
