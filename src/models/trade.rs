use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::order::{datetime_as_millis, OrderSide};

/// One perspective of a settled execution, as recorded by analytics.
/// Append-only; every execution produces two of these.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TradeRecord {
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: f64,
    pub investor: Uuid,
    pub counterparty: Uuid,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub ts: DateTime<Utc>,
}

/// Inbound shape of the `RecordTrade` surface.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordTradeRequest {
    pub trade_id: Option<Uuid>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: f64,
    pub investor: Uuid,
    pub counterparty: Uuid,
}

impl From<RecordTradeRequest> for TradeRecord {
    fn from(req: RecordTradeRequest) -> Self {
        TradeRecord {
            trade_id: req.trade_id.unwrap_or_else(Uuid::new_v4),
            symbol: req.symbol,
            side: req.side,
            qty: req.qty,
            price: req.price,
            investor: req.investor,
            counterparty: req.counterparty,
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopTradedEntry {
    pub symbol: String,
    pub total_qty: i64,
    pub trade_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolatilityEntry {
    pub symbol: String,
    /// `(max - min) / avg * 100` over the window's price history.
    pub volatility_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketSentiment {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStats {
    pub total_trades: i64,
    pub total_volume: i64,
    pub active_investors: i64,
    pub active_symbols: i64,
    /// Mean of `current - open` across all symbols.
    pub trend: f64,
    pub sentiment: MarketSentiment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolPerformance {
    pub symbol: String,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trade_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvestorPerformance {
    pub investor: Uuid,
    pub per_symbol: Vec<SymbolPerformance>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub win_rate: f64,
    pub risk_level: RiskLevel,
    pub trade_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceTrend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricePrediction {
    pub symbol: String,
    pub current_price: f64,
    pub predicted_price: f64,
    pub horizon_minutes: i64,
    /// `clamp(0, R^2 * 100, 100)`.
    pub confidence: f64,
    pub trend: PriceTrend,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeBucket {
    pub ts: i64,
    pub volume: i64,
    pub count: i64,
    pub avg_price: f64,
}
