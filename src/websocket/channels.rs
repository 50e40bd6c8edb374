//! Streaming channel definitions.
//!
//! Clients subscribe to channels; each channel selects one event family
//! for one symbol (or `*`):
//!
//! - `market.{SYMBOL}`: order lifecycle events
//! - `prices.{SYMBOL}`: price ticks and alerts
//! - `*`: everything

use crate::events::{Event, EventFilter, EventKind};

const MARKET_KINDS: [EventKind; 3] = [
    EventKind::OrderPlaced,
    EventKind::OrderExecuted,
    EventKind::OrderCanceled,
];

const PRICE_KINDS: [EventKind; 2] = [EventKind::PriceUpdate, EventKind::PriceAlert];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// market.{symbol}; `*` for all symbols
    Market(String),
    /// prices.{symbol}; `*` for all symbols
    Prices(String),
    /// every event
    All,
}

impl Channel {
    pub fn parse(channel: &str) -> Option<Self> {
        if channel == "*" {
            return Some(Channel::All);
        }
        let (family, symbol) = channel.split_once('.')?;
        if symbol.is_empty() {
            return None;
        }
        let symbol = if symbol == "*" {
            "*".to_string()
        } else {
            symbol.to_uppercase()
        };
        match family {
            "market" => Some(Channel::Market(symbol)),
            "prices" => Some(Channel::Prices(symbol)),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Market(symbol) => format!("market.{}", symbol),
            Channel::Prices(symbol) => format!("prices.{}", symbol),
            Channel::All => "*".to_string(),
        }
    }

    /// Exact per-channel match, applied after the bus-level filter.
    pub fn matches(&self, event: &Event) -> bool {
        let symbol_matches = |want: &str| {
            want == "*" || event.symbol().map(|s| s == want).unwrap_or(false)
        };
        match self {
            Channel::All => true,
            Channel::Market(symbol) => {
                MARKET_KINDS.iter().any(|k| k.as_str() == event.kind_str())
                    && symbol_matches(symbol)
            }
            Channel::Prices(symbol) => {
                PRICE_KINDS.iter().any(|k| k.as_str() == event.kind_str())
                    && symbol_matches(symbol)
            }
        }
    }
}

/// Coarse bus filter covering the union of the given channels. The
/// handler still applies [`Channel::matches`] per event.
pub fn filter_for(channels: &[Channel]) -> EventFilter {
    if channels.iter().any(|c| matches!(c, Channel::All)) {
        return EventFilter::all();
    }

    let mut kinds: Vec<&str> = Vec::new();
    let mut symbols: Vec<String> = Vec::new();
    for channel in channels {
        match channel {
            Channel::Market(symbol) => {
                kinds.extend(MARKET_KINDS.iter().map(|k| k.as_str()));
                symbols.push(symbol.clone());
            }
            Channel::Prices(symbol) => {
                kinds.extend(PRICE_KINDS.iter().map(|k| k.as_str()));
                symbols.push(symbol.clone());
            }
            Channel::All => unreachable!("handled above"),
        }
    }
    EventFilter::all().with_kinds(kinds).with_symbols(symbols)
}
