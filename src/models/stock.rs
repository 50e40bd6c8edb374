use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::order::datetime_as_millis;

/// A listed stock. Created at boot from configuration, never deleted.
///
/// Invariants: `current >= 0.01`, `low <= current <= high`, `open` frozen
/// until the next daily reset, `last_updated` non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Stock {
    pub symbol: String,
    pub name: String,
    pub current: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: i64,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub last_updated: DateTime<Utc>,
}

impl Stock {
    /// Daily change against the frozen open, in percent.
    pub fn change_pct(&self) -> f64 {
        if self.open <= 0.0 {
            return 0.0;
        }
        (self.current - self.open) / self.open * 100.0
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PricePoint {
    pub symbol: String,
    pub price: f64,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeStockRequest {
    pub symbol: String,
    pub price: f64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePriceRequest {
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PriceHistoryQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
}

impl PriceHistoryQuery {
    pub fn get_limit(&self) -> i64 {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }
}
