//! Market service.
//!
//! The front door for trading: pre-validates orders against the
//! portfolio store, drives the matching engine and the settlement
//! coordinator under the symbol gate, and owns the market state machine.
//! The placement pipeline runs detached from the caller, so a cancelled
//! or timed-out request never interrupts in-flight settlement.

use chrono::{Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::models::{
    Order, OrderBookSnapshot, OrderStatus, OrderStatusResponse, PlaceOrderRequest,
    PlaceOrderResponse,
};
use crate::services::matching::MatchingEngine;
use crate::services::portfolio::{validate_with_quote, PortfolioStore};
use crate::services::price::PriceEngine;
use crate::services::settlement::SettlementCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketState {
    Open,
    Closed,
    Paused,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::Open => write!(f, "OPEN"),
            MarketState::Closed => write!(f, "CLOSED"),
            MarketState::Paused => write!(f, "PAUSED"),
        }
    }
}

pub struct MarketService {
    engine: Arc<MatchingEngine>,
    settlement: Arc<SettlementCoordinator>,
    portfolio: Arc<PortfolioStore>,
    price: Arc<PriceEngine>,
    pool: SqlitePool,
    state: RwLock<MarketState>,
    deadline: Duration,
}

impl MarketService {
    pub fn new(
        engine: Arc<MatchingEngine>,
        settlement: Arc<SettlementCoordinator>,
        portfolio: Arc<PortfolioStore>,
        price: Arc<PriceEngine>,
        pool: SqlitePool,
        deadline: Duration,
    ) -> Self {
        Self {
            engine,
            settlement,
            portfolio,
            price,
            pool,
            state: RwLock::new(MarketState::Open),
            deadline,
        }
    }

    /// Place an order. Domain rejections (market closed, failed
    /// pre-trade checks) come back as a `REJECTED` response; malformed
    /// input, unknown references, and duplicate ids are errors.
    pub async fn place_order(
        self: &Arc<Self>,
        req: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, CoreError> {
        let symbol = req.symbol.to_uppercase();
        if req.qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }
        if req.limit_price < 0.0 {
            return Err(CoreError::Validation(
                "limit price must not be negative".to_string(),
            ));
        }
        if !self.price.has_symbol(&symbol) {
            return Err(CoreError::NotFound(format!("symbol {}", symbol)));
        }

        let now = Utc::now();
        let order = Order {
            id: req.order_id.unwrap_or_else(Uuid::new_v4),
            investor: req.investor,
            symbol: symbol.clone(),
            side: req.side,
            qty: req.qty,
            limit_price: req.limit_price,
            filled: 0,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        // Idempotent on id across restarts, not just process lifetime.
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM orders WHERE id = ?1")
            .bind(order.id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(CoreError::Conflict(format!(
                "duplicate order id {}",
                order.id
            )));
        }

        let state = *self.state.read();
        if state != MarketState::Open {
            return self.reject(order, CoreError::MarketClosed(state.to_string())).await;
        }

        // Pre-trade checks; a market order is checked against the
        // current quote.
        let quote = self.price.get_price(&symbol).await?.current;
        if let Err(e) = validate_with_quote(&self.portfolio, &order, quote).await {
            return match e {
                CoreError::InsufficientFunds { .. } | CoreError::InsufficientShares { .. } => {
                    self.reject(order, e).await
                }
                other => Err(other),
            };
        }

        // Admit + settle under the symbol gate, detached from this
        // request: the trade commits even if the caller goes away.
        let service = Arc::clone(self);
        let pipeline = tokio::spawn(async move {
            let book = service.engine.book(&order.symbol);
            let mut book = book.lock().await;
            let is_buy = order.side == crate::models::OrderSide::Buy;
            let order_qty = order.qty;
            let symbol = order.symbol.clone();

            let result = service.engine.admit(&mut book, order).await?;

            for exec in &result.executions {
                // A failed settlement is marked and compensated by the
                // coordinator; it must not wedge the symbol.
                if let Err(e) = service.settlement.settle(exec).await {
                    tracing::error!("Settlement error in order pipeline: {}", e);
                }
            }

            if result.executions.is_empty() && !result.order.status.is_terminal() {
                // Placed but not immediately executed: book pressure at
                // reduced impact.
                if let Err(e) = service.price.apply_pressure(&symbol, order_qty, is_buy).await {
                    tracing::warn!("Book-pressure price apply failed for {}: {}", symbol, e);
                }
            }

            Ok::<_, CoreError>(result)
        });

        let result = match timeout(self.deadline, pipeline).await {
            Ok(joined) => joined
                .map_err(|e| CoreError::Internal(format!("order pipeline panicked: {}", e)))??,
            Err(_) => return Err(CoreError::DeadlineExceeded),
        };

        let order = result.order;
        let message = match order.status {
            OrderStatus::Filled => "order filled".to_string(),
            OrderStatus::PartiallyFilled => {
                format!("order partially filled ({}/{})", order.filled, order.qty)
            }
            _ => "order accepted".to_string(),
        };
        Ok(PlaceOrderResponse {
            order_id: order.id,
            status: order.status,
            filled: order.filled,
            remaining: order.remaining(),
            message,
        })
    }

    async fn reject(
        &self,
        mut order: Order,
        cause: CoreError,
    ) -> Result<PlaceOrderResponse, CoreError> {
        order.status = OrderStatus::Rejected;
        order.updated_at = Utc::now();
        self.engine.persist_rejected(&order).await?;
        tracing::info!("Order {} rejected: {}", order.id, cause);
        Ok(PlaceOrderResponse {
            order_id: order.id,
            status: OrderStatus::Rejected,
            filled: 0,
            remaining: order.qty,
            message: cause.to_string(),
        })
    }

    pub async fn cancel_order(&self, order_id: Uuid, investor: Uuid) -> Result<(), CoreError> {
        self.engine.cancel(order_id, investor).await.map(|_| ())
    }

    /// Status from the engine registry, falling back to the store for
    /// orders placed before the last restart.
    pub async fn order_status(&self, order_id: Uuid) -> Result<OrderStatusResponse, CoreError> {
        if let Some(status) = self.engine.order_status(order_id) {
            return Ok(status);
        }
        let order: Option<Order> = sqlx::query_as("SELECT * FROM orders WHERE id = ?1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        let order = order.ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        Ok(OrderStatusResponse {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            status: order.status,
            qty: order.qty,
            filled: order.filled,
            remaining: order.remaining(),
            // Fill-price detail is not persisted; the limit is the best
            // available approximation for historical orders.
            avg_price: if order.filled > 0 { order.limit_price } else { 0.0 },
        })
    }

    pub async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, CoreError> {
        let symbol = symbol.to_uppercase();
        if !self.price.has_symbol(&symbol) {
            return Err(CoreError::NotFound(format!("symbol {}", symbol)));
        }
        Ok(self.engine.depth(&symbol).await)
    }

    pub fn market_state(&self) -> MarketState {
        *self.state.read()
    }

    /// Transition the market state. The CLOSED -> OPEN transition starts
    /// a new daily window on every symbol.
    pub async fn set_market_state(&self, next: MarketState) -> Result<MarketState, CoreError> {
        let prev = {
            let mut state = self.state.write();
            let prev = *state;
            *state = next;
            prev
        };
        if prev == MarketState::Closed && next == MarketState::Open {
            self.price.reset_daily().await?;
        }
        if prev != next {
            tracing::info!("Market state: {} -> {}", prev, next);
        }
        Ok(next)
    }

    /// Background clock that opens and closes the market on configured
    /// UTC hours. A manual PAUSED state is left alone.
    pub fn spawn_hours_clock(self: &Arc<Self>, open_hour: u32, close_hour: u32) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                "Market hours clock started (open {:02}:00, close {:02}:00 UTC)",
                open_hour,
                close_hour
            );
            loop {
                let hour = Utc::now().hour();
                let in_session = if open_hour <= close_hour {
                    hour >= open_hour && hour < close_hour
                } else {
                    // Overnight session wraps midnight.
                    hour >= open_hour || hour < close_hour
                };
                let target = if in_session {
                    MarketState::Open
                } else {
                    MarketState::Closed
                };

                let current = service.market_state();
                if current != MarketState::Paused && current != target {
                    if let Err(e) = service.set_market_state(target).await {
                        tracing::error!("Market hours transition failed: {}", e);
                    }
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventFilter};
    use crate::models::OrderSide;

    struct Harness {
        market: Arc<MarketService>,
        portfolio: Arc<PortfolioStore>,
        price: Arc<PriceEngine>,
        bus: EventBus,
    }

    async fn harness() -> Harness {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        let bus = EventBus::new(256);
        let price = Arc::new(PriceEngine::new(db.pool.clone(), bus.clone(), 0.001));
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();
        let portfolio = Arc::new(PortfolioStore::new(db.pool.clone(), bus.clone()));
        let engine = Arc::new(MatchingEngine::new(db.pool.clone(), bus.clone()));
        let settlement = Arc::new(SettlementCoordinator::new(
            db.pool.clone(),
            price.clone(),
            bus.clone(),
        ));
        let market = Arc::new(MarketService::new(
            engine,
            settlement,
            portfolio.clone(),
            price.clone(),
            db.pool.clone(),
            Duration::from_secs(5),
        ));
        Harness {
            market,
            portfolio,
            price,
            bus,
        }
    }

    /// Publish a marker and assert it is the next event on the stream,
    /// proving nothing else was published since subscription.
    async fn assert_no_events_since(
        bus: &EventBus,
        stream: &mut crate::events::EventStream,
    ) {
        bus.publish(crate::events::Event::Custom(crate::events::CustomEvent {
            kind: "TEST_SENTINEL".to_string(),
            data: serde_json::Value::Null,
            ts: 0,
        }));
        assert_eq!(stream.recv().await.unwrap().kind_str(), "TEST_SENTINEL");
    }

    fn request(investor: Uuid, side: OrderSide, qty: i64, limit_price: f64) -> PlaceOrderRequest {
        PlaceOrderRequest {
            investor,
            symbol: "AAPL".to_string(),
            side,
            qty,
            limit_price,
            order_id: None,
        }
    }

    #[tokio::test]
    async fn rejects_when_market_not_open() {
        let h = harness().await;
        let investor = h.portfolio.register("A", "a@example.com", 10_000.0).await.unwrap();
        h.market.set_market_state(MarketState::Closed).await.unwrap();

        let mut stream = h.bus.subscribe(EventFilter::all());
        let response = h
            .market
            .place_order(request(investor.id, OrderSide::Buy, 10, 150.0))
            .await
            .unwrap();
        assert_eq!(response.status, OrderStatus::Rejected);

        // Rejection is queryable but publishes nothing.
        let status = h.market.order_status(response.order_id).await.unwrap();
        assert_eq!(status.status, OrderStatus::Rejected);
        assert_no_events_since(&h.bus, &mut stream).await;
    }

    #[tokio::test]
    async fn insufficient_funds_rejects_without_events() {
        let h = harness().await;
        let investor = h.portfolio.register("A", "a@example.com", 100.0).await.unwrap();

        let mut stream = h.bus.subscribe(EventFilter::all());
        let response = h
            .market
            .place_order(request(investor.id, OrderSide::Buy, 10, 150.0))
            .await
            .unwrap();
        assert_eq!(response.status, OrderStatus::Rejected);
        assert!(response.message.contains("insufficient funds"));

        let book = h.market.order_book("AAPL").await.unwrap();
        assert!(book.bids.is_empty() && book.asks.is_empty());
        assert_no_events_since(&h.bus, &mut stream).await;
    }

    #[tokio::test]
    async fn resting_order_emits_placed_and_pressure_tick() {
        let h = harness().await;
        let investor = h.portfolio.register("A", "a@example.com", 10_000.0).await.unwrap();

        let mut market_events = h.bus.subscribe(EventFilter::all().with_kinds(["ORDER_PLACED"]));
        let mut price_events = h.bus.subscribe(EventFilter::all().with_kinds(["PRICE_UPDATE"]));

        let response = h
            .market
            .place_order(request(investor.id, OrderSide::Buy, 10, 149.0))
            .await
            .unwrap();
        assert_eq!(response.status, OrderStatus::Pending);
        assert_eq!(response.remaining, 10);

        assert_eq!(market_events.recv().await.unwrap().kind_str(), "ORDER_PLACED");
        // Book pressure moved the quote at reduced impact.
        assert_eq!(price_events.recv().await.unwrap().kind_str(), "PRICE_UPDATE");

        let book = h.market.order_book("AAPL").await.unwrap();
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].qty, 10);
    }

    #[tokio::test]
    async fn duplicate_order_id_is_conflict() {
        let h = harness().await;
        let investor = h.portfolio.register("A", "a@example.com", 100_000.0).await.unwrap();

        let id = Uuid::new_v4();
        let mut req = request(investor.id, OrderSide::Buy, 10, 149.0);
        req.order_id = Some(id);
        h.market.place_order(req.clone()).await.unwrap();

        let err = h.market.place_order(req).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // No double insert.
        let book = h.market.order_book("AAPL").await.unwrap();
        assert_eq!(book.bids[0].qty, 10);
    }

    #[tokio::test]
    async fn unknown_symbol_is_not_found() {
        let h = harness().await;
        let investor = h.portfolio.register("A", "a@example.com", 10_000.0).await.unwrap();
        let mut req = request(investor.id, OrderSide::Buy, 10, 150.0);
        req.symbol = "NOPE".to_string();
        let err = h.market.place_order(req).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn closed_to_open_resets_daily_window() {
        let h = harness().await;
        let investor = h.portfolio.register("A", "a@example.com", 100_000.0).await.unwrap();

        // A resting bid pressures the price off the open.
        h.market
            .place_order(request(investor.id, OrderSide::Buy, 50, 149.0))
            .await
            .unwrap();
        let before = h.price.get_price("AAPL").await.unwrap();
        assert_ne!(before.current, before.open);

        h.market.set_market_state(MarketState::Closed).await.unwrap();
        h.market.set_market_state(MarketState::Open).await.unwrap();

        let after = h.price.get_price("AAPL").await.unwrap();
        assert_eq!(after.open, after.current);
        assert_eq!(after.high, after.current);
        assert_eq!(after.low, after.current);

        // PAUSED -> OPEN is not a daily boundary.
        h.market.set_market_state(MarketState::Paused).await.unwrap();
        h.market.set_market_state(MarketState::Open).await.unwrap();
        assert_eq!(h.market.market_state(), MarketState::Open);
    }
}
