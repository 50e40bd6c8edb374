//! Per-symbol order book.
//!
//! Two priority structures: bids (best price = highest) and asks (best
//! price = lowest), each a `BTreeMap` of FIFO price levels plus a FIFO
//! queue of market orders that outranks every limit level. The book is
//! exclusively owned by the matching engine and accessed under the
//! symbol's serialization gate.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use super::types::{BookOrder, Execution, PriceKey};
use crate::models::{DepthLevel, Order, OrderSide, OrderStatus};

pub struct BookSide {
    side: OrderSide,
    /// Market orders, FIFO. Ordered as if infinitely aggressive.
    market: VecDeque<BookOrder>,
    /// Limit orders, FIFO per price level.
    levels: BTreeMap<PriceKey, VecDeque<BookOrder>>,
}

impl BookSide {
    fn new(side: OrderSide) -> Self {
        Self {
            side,
            market: VecDeque::new(),
            levels: BTreeMap::new(),
        }
    }

    fn best_level_mut(&mut self) -> Option<&mut VecDeque<BookOrder>> {
        match self.side {
            OrderSide::Buy => self.levels.values_mut().next_back(),
            OrderSide::Sell => self.levels.values_mut().next(),
        }
    }

    /// Top of this side: front market order if any, else the front of
    /// the best limit level.
    pub fn peek(&self) -> Option<&BookOrder> {
        if let Some(front) = self.market.front() {
            return Some(front);
        }
        match self.side {
            OrderSide::Buy => self.levels.values().next_back(),
            OrderSide::Sell => self.levels.values().next(),
        }
        .and_then(|queue| queue.front())
    }

    fn peek_mut(&mut self) -> Option<&mut BookOrder> {
        if !self.market.is_empty() {
            return self.market.front_mut();
        }
        self.best_level_mut().and_then(|queue| queue.front_mut())
    }

    /// Pop the top entry (the one `peek` returns).
    fn pop_top(&mut self) -> Option<BookOrder> {
        if let Some(front) = self.market.pop_front() {
            return Some(front);
        }
        let key = match self.side {
            OrderSide::Buy => self.levels.keys().next_back().copied(),
            OrderSide::Sell => self.levels.keys().next().copied(),
        }?;
        let queue = self.levels.get_mut(&key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.levels.remove(&key);
        }
        entry
    }

    fn insert(&mut self, entry: BookOrder) {
        if entry.order.is_market() {
            self.market.push_back(entry);
        } else {
            self.levels
                .entry(PriceKey::from_f64(entry.order.limit_price))
                .or_default()
                .push_back(entry);
        }
    }

    fn remove(&mut self, order_id: Uuid, key: Option<PriceKey>) -> Option<BookOrder> {
        match key {
            None => {
                let pos = self.market.iter().position(|e| e.order.id == order_id)?;
                self.market.remove(pos)
            }
            Some(key) => {
                let queue = self.levels.get_mut(&key)?;
                let pos = queue.iter().position(|e| e.order.id == order_id)?;
                let entry = queue.remove(pos);
                if queue.is_empty() {
                    self.levels.remove(&key);
                }
                entry
            }
        }
    }

    /// Price-aggregated depth: `(price, remaining qty, order count)` per
    /// level, best first. Resting market orders carry no price level and
    /// are not part of the aggregation.
    fn depth(&self) -> Vec<DepthLevel> {
        let aggregate = |(key, queue): (&PriceKey, &VecDeque<BookOrder>)| DepthLevel {
            price: key.to_f64(),
            qty: queue.iter().map(|e| e.order.remaining()).sum(),
            count: queue.len(),
        };
        match self.side {
            OrderSide::Buy => self.levels.iter().rev().map(aggregate).collect(),
            OrderSide::Sell => self.levels.iter().map(aggregate).collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.market.is_empty() && self.levels.is_empty()
    }
}

pub struct OrderBook {
    symbol: String,
    bids: BookSide,
    asks: BookSide,
    /// Order id -> (side, price level; `None` for the market queue).
    index: HashMap<Uuid, (OrderSide, Option<PriceKey>)>,
}

impl OrderBook {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            bids: BookSide::new(OrderSide::Buy),
            asks: BookSide::new(OrderSide::Sell),
            index: HashMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn contains(&self, order_id: Uuid) -> bool {
        self.index.contains_key(&order_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn best_bid(&self) -> Option<&BookOrder> {
        self.bids.peek()
    }

    pub fn best_ask(&self) -> Option<&BookOrder> {
        self.asks.peek()
    }

    /// Insert a live order. The caller guarantees the id is unique.
    pub fn insert(&mut self, entry: BookOrder) {
        let key = if entry.order.is_market() {
            None
        } else {
            Some(PriceKey::from_f64(entry.order.limit_price))
        };
        self.index.insert(entry.order.id, (entry.order.side, key));
        match entry.order.side {
            OrderSide::Buy => self.bids.insert(entry),
            OrderSide::Sell => self.asks.insert(entry),
        }
    }

    /// Remove an order without filling it (the cancel path).
    pub fn remove(&mut self, order_id: Uuid) -> Option<BookOrder> {
        let (side, key) = self.index.remove(&order_id)?;
        match side {
            OrderSide::Buy => self.bids.remove(order_id, key),
            OrderSide::Sell => self.asks.remove(order_id, key),
        }
    }

    /// Repeatedly cross the top of both sides until the book no longer
    /// crosses. Returns the executions in fill order plus the final
    /// snapshot of every order whose fill state changed.
    ///
    /// Price rule: a market top takes the opposite limit; two limits
    /// trade at the resting ask. Two market tops have no price
    /// reference and do not cross.
    pub fn uncross(&mut self) -> (Vec<Execution>, HashMap<Uuid, Order>) {
        let mut executions = Vec::new();
        let mut touched: HashMap<Uuid, Order> = HashMap::new();

        loop {
            let (bid_market, bid_price, bid_seq, bid_remaining) = match self.bids.peek() {
                Some(e) => (
                    e.order.is_market(),
                    e.order.limit_price,
                    e.seq,
                    e.order.remaining(),
                ),
                None => break,
            };
            let (ask_market, ask_price, ask_seq, ask_remaining) = match self.asks.peek() {
                Some(e) => (
                    e.order.is_market(),
                    e.order.limit_price,
                    e.seq,
                    e.order.remaining(),
                ),
                None => break,
            };

            if bid_market && ask_market {
                break;
            }
            let crosses = bid_market || ask_market || bid_price >= ask_price;
            if !crosses {
                break;
            }

            let price = if bid_market {
                ask_price
            } else if ask_market {
                bid_price
            } else {
                ask_price
            };
            let qty = bid_remaining.min(ask_remaining);
            let aggressor_is_buy = if bid_market != ask_market {
                bid_market
            } else {
                bid_seq > ask_seq
            };

            let now = Utc::now();
            let mut fill = |entry: &mut BookOrder| {
                entry.order.filled += qty;
                entry.order.status = if entry.order.remaining() == 0 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                entry.order.updated_at = now;
                touched.insert(entry.order.id, entry.order.clone());
            };

            let bid_entry = self.bids.peek_mut().expect("bid top vanished");
            fill(&mut *bid_entry);
            let (buy_order_id, buyer) = (bid_entry.order.id, bid_entry.order.investor);
            let bid_done = bid_entry.order.remaining() == 0;

            let ask_entry = self.asks.peek_mut().expect("ask top vanished");
            fill(&mut *ask_entry);
            let (sell_order_id, seller) = (ask_entry.order.id, ask_entry.order.investor);
            let ask_done = ask_entry.order.remaining() == 0;

            executions.push(Execution {
                id: Uuid::new_v4(),
                buy_order_id,
                sell_order_id,
                symbol: self.symbol.clone(),
                qty,
                price,
                buyer,
                seller,
                aggressor_is_buy,
                ts: now,
            });

            if bid_done {
                self.bids.pop_top();
                self.index.remove(&buy_order_id);
            }
            if ask_done {
                self.asks.pop_top();
                self.index.remove(&sell_order_id);
            }
        }

        (executions, touched)
    }

    pub fn depth(&self) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        (self.bids.depth(), self.asks.depth())
    }
}
