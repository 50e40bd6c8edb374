//! Order matching.
//!
//! Price-time priority matching over per-symbol books:
//!
//! ```text
//! MarketService
//!   ├→ MatchingEngine (in-memory matching, owns `orders`)
//!   │    └→ OrderBook (per symbol, behind the symbol gate)
//!   └→ SettlementCoordinator (per execution, before the gate releases)
//! ```

mod book;
mod engine;
mod types;

pub use book::OrderBook;
pub use engine::MatchingEngine;
pub use types::{AdmitResult, BookOrder, Execution, PriceKey};
