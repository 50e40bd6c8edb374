use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

// Helper module to serialize DateTime as milliseconds timestamp
pub(crate) mod datetime_as_millis {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(dt.timestamp_millis())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal orders never re-enter a book.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// A live or historical order. `limit_price == 0.0` marks a market order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub investor: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub limit_price: f64,
    pub filled: i64,
    pub status: OrderStatus,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_market(&self) -> bool {
        self.limit_price == 0.0
    }

    pub fn remaining(&self) -> i64 {
        self.qty - self.filled
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub investor: Uuid,
    #[validate(length(min = 1, max = 10))]
    pub symbol: String,
    pub side: OrderSide,
    #[validate(range(min = 1))]
    pub qty: i64,
    /// Non-negative; zero means market order.
    #[validate(range(min = 0.0))]
    pub limit_price: f64,
    /// Optional client-supplied id. Reusing an id never double-inserts.
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled: i64,
    pub remaining: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelOrderRequest {
    pub investor: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusResponse {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub qty: i64,
    pub filled: i64,
    pub remaining: i64,
    /// Volume-weighted average fill price; zero when nothing filled.
    pub avg_price: f64,
}

/// One aggregated price level of a book side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub ts: i64,
}
