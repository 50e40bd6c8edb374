//! Matching engine types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::order::datetime_as_millis;
use crate::models::Order;

// ============================================================================
// Price Key
// ============================================================================

/// Price level key with 6 decimal precision for exact comparison and
/// aggregation. Limit prices are client-supplied with at most a few
/// decimals; the scaling only has to be stable, not lossless for every
/// float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i64);

const PRICE_SCALE: f64 = 1_000_000.0;

impl PriceKey {
    pub fn from_f64(price: f64) -> Self {
        PriceKey((price * PRICE_SCALE).round() as i64)
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / PRICE_SCALE
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book Entry
// ============================================================================

/// A resting order plus its arrival sequence number. The sequence breaks
/// time-priority ties deterministically and decides the aggressor when
/// two limit orders cross.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub seq: u64,
    pub order: Order,
}

// ============================================================================
// Execution
// ============================================================================

/// One fill between a buy and a sell order. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: Uuid,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub symbol: String,
    pub qty: i64,
    pub price: f64,
    pub buyer: Uuid,
    pub seller: Uuid,
    /// Direction of the price pressure this execution exerts: the market
    /// order aggresses; between two limits, the later arrival does.
    pub aggressor_is_buy: bool,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub ts: DateTime<Utc>,
}

// ============================================================================
// Admit Result
// ============================================================================

/// Outcome of admitting one order: its post-match snapshot, the
/// executions produced during the call, and the final snapshots of every
/// counterparty order that filled.
#[derive(Debug, Clone)]
pub struct AdmitResult {
    pub order: Order,
    pub executions: Vec<Execution>,
    pub counterparties: Vec<Order>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_key_round_trip() {
        let price = 97_500.50;
        let key = PriceKey::from_f64(price);
        assert_eq!(key.to_f64(), price);
    }

    #[test]
    fn price_key_ordering() {
        assert!(PriceKey::from_f64(100.0) < PriceKey::from_f64(200.0));
        assert!(PriceKey::from_f64(150.01) > PriceKey::from_f64(150.0));
    }
}
