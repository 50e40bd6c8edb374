//! Event taxonomy shared by the bus, the streaming surface, and webhooks.

mod bus;

pub use bus::{EventBus, EventStream};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::models::OrderSide;

/// Closed set of event kinds. Names are case-sensitive and appear
/// verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    OrderPlaced,
    OrderExecuted,
    OrderCanceled,
    PriceUpdate,
    PriceAlert,
    BalanceUpdated,
    NewTransaction,
    TopStocksUpdated,
    PredictionAvailable,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::OrderPlaced,
        EventKind::OrderExecuted,
        EventKind::OrderCanceled,
        EventKind::PriceUpdate,
        EventKind::PriceAlert,
        EventKind::BalanceUpdated,
        EventKind::NewTransaction,
        EventKind::TopStocksUpdated,
        EventKind::PredictionAvailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "ORDER_PLACED",
            EventKind::OrderExecuted => "ORDER_EXECUTED",
            EventKind::OrderCanceled => "ORDER_CANCELED",
            EventKind::PriceUpdate => "PRICE_UPDATE",
            EventKind::PriceAlert => "PRICE_ALERT",
            EventKind::BalanceUpdated => "BALANCE_UPDATED",
            EventKind::NewTransaction => "NEW_TRANSACTION",
            EventKind::TopStocksUpdated => "TOP_STOCKS_UPDATED",
            EventKind::PredictionAvailable => "PREDICTION_AVAILABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle event (`ORDER_PLACED` / `ORDER_EXECUTED` / `ORDER_CANCELED`).
#[derive(Debug, Clone, Serialize)]
pub struct MarketEvent {
    pub kind: EventKind,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: f64,
    pub investor: Uuid,
    pub ts: i64,
}

/// Price tick (`PRICE_UPDATE` / `PRICE_ALERT`).
#[derive(Debug, Clone, Serialize)]
pub struct PriceEvent {
    pub kind: EventKind,
    pub symbol: String,
    pub price: f64,
    pub change_pct: f64,
    pub ts: i64,
}

/// Anything published through `POST /events` or emitted outside the two
/// structured families (compensation events included).
#[derive(Debug, Clone, Serialize)]
pub struct CustomEvent {
    pub kind: String,
    pub data: serde_json::Value,
    pub ts: i64,
}

/// Terminal marker delivered to a subscriber that was dropped on queue
/// overflow. Never published; synthesized by the stream itself.
#[derive(Debug, Clone, Serialize)]
pub struct OverflowEvent {
    pub kind: &'static str,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    Market(MarketEvent),
    Price(PriceEvent),
    Custom(CustomEvent),
    Overflow(OverflowEvent),
}

impl Event {
    pub fn overflow() -> Self {
        Event::Overflow(OverflowEvent {
            kind: "OVERFLOW",
            ts: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn kind_str(&self) -> &str {
        match self {
            Event::Market(e) => e.kind.as_str(),
            Event::Price(e) => e.kind.as_str(),
            Event::Custom(e) => &e.kind,
            Event::Overflow(e) => e.kind,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Event::Market(e) => Some(&e.symbol),
            Event::Price(e) => Some(&e.symbol),
            Event::Custom(_) | Event::Overflow(_) => None,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, Event::Overflow(_))
    }
}

/// Subscription filter. `None` means "no constraint".
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<String>>,
    symbols: Option<HashSet<String>>,
}

impl EventFilter {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a set of kind names. `"*"` anywhere in the set makes
    /// the filter unconstrained on kind.
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = kinds.into_iter().map(Into::into).collect();
        self.kinds = if set.contains("*") { None } else { Some(set) };
        self
    }

    /// Restrict to a set of symbols. Events without a symbol (custom
    /// publishes) pass a symbol filter.
    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = symbols.into_iter().map(Into::into).collect();
        self.symbols = if set.contains("*") { None } else { Some(set) };
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(event.kind_str()) {
                return false;
            }
        }
        if let Some(symbols) = &self.symbols {
            if let Some(symbol) = event.symbol() {
                if !symbols.contains(symbol) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_event(symbol: &str) -> Event {
        Event::Price(PriceEvent {
            kind: EventKind::PriceUpdate,
            symbol: symbol.to_string(),
            price: 100.0,
            change_pct: 0.0,
            ts: 0,
        })
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("PRICE_update"), None);
    }

    #[test]
    fn wildcard_filter_matches_everything() {
        let filter = EventFilter::all();
        assert!(filter.matches(&price_event("AAPL")));
    }

    #[test]
    fn kind_filter() {
        let filter = EventFilter::all().with_kinds(["ORDER_PLACED"]);
        assert!(!filter.matches(&price_event("AAPL")));

        let star = EventFilter::all().with_kinds(["*"]);
        assert!(star.matches(&price_event("AAPL")));
    }

    #[test]
    fn symbol_filter() {
        let filter = EventFilter::all().with_symbols(["MSFT"]);
        assert!(filter.matches(&price_event("MSFT")));
        assert!(!filter.matches(&price_event("AAPL")));
    }

    #[test]
    fn event_serializes_flat() {
        let v = serde_json::to_value(price_event("AAPL")).unwrap();
        assert_eq!(v["kind"], "PRICE_UPDATE");
        assert_eq!(v["symbol"], "AAPL");
    }
}
