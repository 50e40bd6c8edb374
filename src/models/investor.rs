use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::order::{datetime_as_millis, OrderSide};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Investor {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub balance: f64,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub created_at: DateTime<Utc>,
}

/// One `(investor, symbol)` position. Deleted when qty reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Holding {
    pub investor: Uuid,
    pub symbol: String,
    pub qty: i64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub investor: Uuid,
    pub symbol: String,
    #[serde(rename = "type")]
    pub tx_type: OrderSide,
    pub qty: i64,
    pub price: f64,
    pub total: f64,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(range(min = 0.0))]
    pub initial_balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustBalanceRequest {
    pub amount: f64,
    pub reason: Option<String>,
}

/// A holding decorated with the current quote.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioPosition {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: f64,
    pub current_price: f64,
    pub current_value: f64,
    pub profit_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub investor: Uuid,
    pub balance: f64,
    pub positions: Vec<PortfolioPosition>,
    pub total_value: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransactionQuery {
    pub limit: Option<i64>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TransactionQuery {
    pub fn get_limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateOrderRequest {
    pub investor: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyTradeRequest {
    pub investor: Uuid,
    pub symbol: String,
    /// Positive buys, negative sells.
    pub qty: i64,
    pub price: f64,
    pub tx_id: Option<Uuid>,
}
