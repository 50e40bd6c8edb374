//! Price engine.
//!
//! Owns the `stocks` and `price_history` tables. Prices are synthetic:
//! each settled execution (and each resting order, at reduced impact)
//! nudges the quote as a function of size and direction. Mutations for a
//! symbol are serialized behind its mutex.

use chrono::Utc;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::StockSpec;
use crate::errors::CoreError;
use crate::events::{Event, EventBus, EventKind, PriceEvent};
use crate::models::{PricePoint, PriceHistoryQuery, Stock};

/// Impact factor for an order resting on the book without executing.
pub const PRESSURE_IMPACT: f64 = 0.3;
/// Impact factor for a settled execution.
pub const TRADE_IMPACT: f64 = 1.0;
/// Hard floor under every quote.
pub const PRICE_FLOOR: f64 = 0.01;
/// Single-move percentage that triggers a PRICE_ALERT.
const ALERT_MOVE_PCT: f64 = 5.0;

pub struct PriceEngine {
    pool: SqlitePool,
    bus: EventBus,
    volatility: f64,
    stocks: DashMap<String, Arc<Mutex<Stock>>>,
}

impl PriceEngine {
    pub fn new(pool: SqlitePool, bus: EventBus, volatility: f64) -> Self {
        Self {
            pool,
            bus,
            volatility,
            stocks: DashMap::new(),
        }
    }

    /// Load stocks persisted in the store, then create any configured
    /// stock that is missing. Stocks are never deleted.
    pub async fn seed(&self, specs: &[StockSpec]) -> Result<usize, CoreError> {
        let rows: Vec<Stock> = sqlx::query_as("SELECT * FROM stocks")
            .fetch_all(&self.pool)
            .await?;
        for stock in rows {
            self.stocks
                .insert(stock.symbol.clone(), Arc::new(Mutex::new(stock)));
        }

        let mut created = 0;
        for spec in specs {
            if !self.stocks.contains_key(&spec.symbol) {
                self.initialize_stock(&spec.symbol, spec.price, Some(&spec.name))
                    .await?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Create a stock if it does not exist yet; returns the current
    /// record either way.
    pub async fn initialize_stock(
        &self,
        symbol: &str,
        price: f64,
        name: Option<&str>,
    ) -> Result<Stock, CoreError> {
        let symbol = symbol.to_uppercase();
        if price < PRICE_FLOOR {
            return Err(CoreError::Validation(format!(
                "initial price must be at least {}",
                PRICE_FLOOR
            )));
        }
        if let Some(existing) = self.stocks.get(&symbol) {
            return Ok(existing.lock().await.clone());
        }

        let stock = Stock {
            symbol: symbol.clone(),
            name: name.unwrap_or(&symbol).to_string(),
            current: price,
            open: price,
            high: price,
            low: price,
            volume: 0,
            last_updated: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO stocks (symbol, name, current, open, high, low, volume, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (symbol) DO NOTHING
            "#,
        )
        .bind(&stock.symbol)
        .bind(&stock.name)
        .bind(stock.current)
        .bind(stock.open)
        .bind(stock.high)
        .bind(stock.low)
        .bind(stock.volume)
        .bind(stock.last_updated)
        .execute(&self.pool)
        .await?;

        self.record_history(&stock.symbol, stock.current).await?;
        self.stocks
            .insert(symbol, Arc::new(Mutex::new(stock.clone())));
        tracing::info!("Initialized stock {} @ {:.2}", stock.symbol, stock.current);
        Ok(stock)
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.stocks.contains_key(symbol)
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Stock, CoreError> {
        let state = self
            .stocks
            .get(symbol)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::NotFound(format!("symbol {}", symbol)))?;
        let stock = state.lock().await;
        Ok(stock.clone())
    }

    pub async fn get_prices(&self) -> Vec<Stock> {
        let handles: Vec<Arc<Mutex<Stock>>> =
            self.stocks.iter().map(|entry| entry.value().clone()).collect();
        let mut stocks = Vec::with_capacity(handles.len());
        for handle in handles {
            stocks.push(handle.lock().await.clone());
        }
        stocks.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        stocks
    }

    /// Symbol -> current quote, for portfolio decoration.
    pub async fn quote_map(&self) -> std::collections::HashMap<String, f64> {
        self.get_prices()
            .await
            .into_iter()
            .map(|s| (s.symbol, s.current))
            .collect()
    }

    /// Settled-execution impact: full weight, counts toward volume.
    pub async fn apply_trade(
        &self,
        symbol: &str,
        qty: i64,
        is_buy: bool,
    ) -> Result<Stock, CoreError> {
        self.apply_impact(symbol, qty, is_buy, TRADE_IMPACT, true).await
    }

    /// Book-pressure impact: an order placed but not (fully) executed
    /// moves the quote at reduced weight and does not count as volume.
    pub async fn apply_pressure(
        &self,
        symbol: &str,
        qty: i64,
        is_buy: bool,
    ) -> Result<Stock, CoreError> {
        self.apply_impact(symbol, qty, is_buy, PRESSURE_IMPACT, false)
            .await
    }

    async fn apply_impact(
        &self,
        symbol: &str,
        qty: i64,
        is_buy: bool,
        impact: f64,
        record_volume: bool,
    ) -> Result<Stock, CoreError> {
        if qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }
        let state = self
            .stocks
            .get(symbol)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::NotFound(format!("symbol {}", symbol)))?;
        let mut stock = state.lock().await;

        let dir = if is_buy { 1.0 } else { -1.0 };
        let noise = 1.0 + (rand::random::<f64>() - 0.5) * 0.002;
        let delta =
            stock.current * self.volatility * dir * (1.0 + qty as f64 / 100.0).ln() * noise * impact;
        let prev = stock.current;
        let next = (stock.current + delta).max(PRICE_FLOOR);

        stock.current = next;
        stock.high = stock.high.max(next);
        stock.low = stock.low.min(next);
        if record_volume {
            stock.volume += qty;
        }
        stock.last_updated = Utc::now();

        self.persist(&stock).await?;
        self.record_history(symbol, next).await?;

        self.publish_tick(EventKind::PriceUpdate, &stock);
        if prev > 0.0 && ((next - prev) / prev * 100.0).abs() >= ALERT_MOVE_PCT {
            self.publish_tick(EventKind::PriceAlert, &stock);
        }

        tracing::debug!(
            "Price applied: {} {:.4} -> {:.4} (qty={}, buy={}, impact={})",
            symbol,
            prev,
            next,
            qty,
            is_buy,
            impact
        );
        Ok(stock.clone())
    }

    /// Direct quote override. Clamped to the floor; OHLC and history
    /// update as with any other move.
    pub async fn update_price(&self, symbol: &str, price: f64) -> Result<Stock, CoreError> {
        if price <= 0.0 {
            return Err(CoreError::Validation("price must be positive".to_string()));
        }
        let state = self
            .stocks
            .get(symbol)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::NotFound(format!("symbol {}", symbol)))?;
        let mut stock = state.lock().await;

        let next = price.max(PRICE_FLOOR);
        stock.current = next;
        stock.high = stock.high.max(next);
        stock.low = stock.low.min(next);
        stock.last_updated = Utc::now();

        self.persist(&stock).await?;
        self.record_history(symbol, next).await?;
        self.publish_tick(EventKind::PriceUpdate, &stock);
        Ok(stock.clone())
    }

    /// Newest-first price history, optionally bounded to `[start, end]`
    /// millisecond timestamps.
    pub async fn history(
        &self,
        symbol: &str,
        query: &PriceHistoryQuery,
    ) -> Result<Vec<PricePoint>, CoreError> {
        if !self.has_symbol(symbol) {
            return Err(CoreError::NotFound(format!("symbol {}", symbol)));
        }
        let start = query
            .start
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);
        let end = query
            .end
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let rows: Vec<PricePoint> = sqlx::query_as(
            r#"
            SELECT symbol, price, ts FROM price_history
            WHERE symbol = ?1 AND ts >= ?2 AND ts <= ?3
            ORDER BY ts DESC
            LIMIT ?4
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .bind(query.get_limit())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Market-open transition: freeze a fresh daily window.
    pub async fn reset_daily(&self) -> Result<(), CoreError> {
        let handles: Vec<Arc<Mutex<Stock>>> =
            self.stocks.iter().map(|entry| entry.value().clone()).collect();
        for handle in handles {
            let mut stock = handle.lock().await;
            stock.open = stock.current;
            stock.high = stock.current;
            stock.low = stock.current;
            stock.last_updated = Utc::now();
            self.persist(&stock).await?;
        }
        tracing::info!("Daily OHLC reset for {} symbols", self.stocks.len());
        Ok(())
    }

    fn publish_tick(&self, kind: EventKind, stock: &Stock) {
        self.bus.publish(Event::Price(PriceEvent {
            kind,
            symbol: stock.symbol.clone(),
            price: stock.current,
            change_pct: stock.change_pct(),
            ts: Utc::now().timestamp_millis(),
        }));
    }

    async fn persist(&self, stock: &Stock) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE stocks
            SET current = ?1, open = ?2, high = ?3, low = ?4, volume = ?5, last_updated = ?6
            WHERE symbol = ?7
            "#,
        )
        .bind(stock.current)
        .bind(stock.open)
        .bind(stock.high)
        .bind(stock.low)
        .bind(stock.volume)
        .bind(stock.last_updated)
        .bind(&stock.symbol)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_history(&self, symbol: &str, price: f64) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO price_history (symbol, price, ts) VALUES (?1, ?2, ?3)")
            .bind(symbol)
            .bind(price)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;

    async fn engine() -> (PriceEngine, EventBus) {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        let bus = EventBus::new(64);
        (PriceEngine::new(db.pool, bus.clone(), 0.001), bus)
    }

    #[tokio::test]
    async fn initialize_and_read() {
        let (price, _bus) = engine().await;
        let stock = price
            .initialize_stock("aapl", 150.0, Some("Apple Inc"))
            .await
            .unwrap();
        assert_eq!(stock.symbol, "AAPL");
        assert_eq!(stock.open, 150.0);

        // Idempotent: a second init returns the live record.
        let again = price.initialize_stock("AAPL", 999.0, None).await.unwrap();
        assert_eq!(again.current, 150.0);

        assert_eq!(price.get_price("AAPL").await.unwrap().current, 150.0);
        assert!(price.get_price("MSFT").await.is_err());
    }

    #[tokio::test]
    async fn buy_pressure_raises_and_sell_lowers() {
        let (price, bus) = engine().await;
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();
        let mut stream = bus.subscribe(EventFilter::all());

        let up = price.apply_trade("AAPL", 100, true).await.unwrap();
        assert!(up.current > 150.0);
        assert_eq!(up.volume, 100);
        assert!(up.high >= up.current && up.low <= 150.0);

        let down = price.apply_trade("AAPL", 100, false).await.unwrap();
        assert!(down.current < up.current);

        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind_str(), "PRICE_UPDATE");
    }

    #[tokio::test]
    async fn pressure_impact_smaller_than_trade_and_no_volume() {
        let (price, _bus) = engine().await;
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();

        let after = price.apply_pressure("AAPL", 100, true).await.unwrap();
        assert!(after.current > 150.0);
        assert_eq!(after.volume, 0);

        // Reduced impact: noise is within +-0.1%, so a 0.3-factor move
        // stays strictly below a full-impact move on the same state.
        let full_move = 150.0 * 0.001 * (1.0f64 + 1.0).ln();
        assert!(after.current - 150.0 < full_move);
    }

    #[tokio::test]
    async fn price_floor_holds() {
        let (price, _bus) = engine().await;
        price.initialize_stock("PNY", 0.01, None).await.unwrap();
        for _ in 0..10 {
            let stock = price.apply_trade("PNY", 1_000_000, false).await.unwrap();
            assert!(stock.current >= PRICE_FLOOR);
        }
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let (price, _bus) = engine().await;
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();
        price.apply_trade("AAPL", 10, true).await.unwrap();
        price.apply_trade("AAPL", 10, true).await.unwrap();

        let history = price
            .history("AAPL", &PriceHistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].ts >= w[1].ts));
    }

    #[tokio::test]
    async fn daily_reset_freezes_window() {
        let (price, _bus) = engine().await;
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();
        price.apply_trade("AAPL", 500, true).await.unwrap();

        price.reset_daily().await.unwrap();
        let stock = price.get_price("AAPL").await.unwrap();
        assert_eq!(stock.open, stock.current);
        assert_eq!(stock.high, stock.current);
        assert_eq!(stock.low, stock.current);
    }

    #[tokio::test]
    async fn direct_update_clamps_to_floor() {
        let (price, _bus) = engine().await;
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();
        let stock = price.update_price("AAPL", 0.001).await.unwrap();
        assert_eq!(stock.current, PRICE_FLOOR);
        assert!(price.update_price("AAPL", -1.0).await.is_err());
    }
}
