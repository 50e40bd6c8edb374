//! Settlement coordinator.
//!
//! Applies every downstream effect of one execution before the matching
//! engine admits the next order on the symbol: both investor legs and
//! the analytics rows commit in a single store transaction keyed on the
//! execution id (retries are idempotent), then the price impact is
//! applied and the events go out. A leg that cannot apply marks the
//! execution `SETTLEMENT_FAILED` and publishes a compensation event;
//! nothing is silently dropped.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::events::{CustomEvent, Event, EventBus, EventKind, MarketEvent};
use crate::metrics::names;
use crate::models::{OrderSide, Transaction};
use crate::services::analytics::AnalyticsRecorder;
use crate::services::matching::Execution;
use crate::services::portfolio::{
    apply_trade_conn, balance_updated_event, new_transaction_event,
};
use crate::services::price::PriceEngine;
use std::sync::Arc;

const MAX_ATTEMPTS: u32 = 3;

const STATUS_SETTLED: &str = "SETTLED";
const STATUS_FAILED: &str = "SETTLEMENT_FAILED";

pub struct SettlementCoordinator {
    pool: SqlitePool,
    price: Arc<PriceEngine>,
    bus: EventBus,
}

impl SettlementCoordinator {
    pub fn new(pool: SqlitePool, price: Arc<PriceEngine>, bus: EventBus) -> Self {
        Self { pool, price, bus }
    }

    /// Settle one execution. Transient store errors are retried with the
    /// execution id as the idempotency key; domain failures are
    /// terminal.
    pub async fn settle(&self, exec: &Execution) -> Result<(), CoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_settle(exec).await {
                Ok(Some((buy_tx, sell_tx))) => {
                    self.apply_downstream(exec, &buy_tx, &sell_tx).await;
                    metrics::counter!(names::SETTLEMENTS_TOTAL).increment(1);
                    return Ok(());
                }
                Ok(None) => {
                    // Already settled by an earlier attempt.
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    metrics::counter!(names::SETTLEMENT_RETRIES_TOTAL).increment(1);
                    tracing::warn!(
                        "Settlement attempt {} for execution {} failed: {}; retrying",
                        attempt,
                        exec.id,
                        e
                    );
                }
                Err(e) => {
                    self.mark_failed(exec, &e).await;
                    metrics::counter!(names::SETTLEMENT_FAILURES_TOTAL).increment(1);
                    tracing::error!(
                        "Settlement failed for execution {} ({} {} x {} @ {}): {}",
                        exec.id,
                        exec.symbol,
                        exec.qty,
                        exec.price,
                        exec.buyer,
                        e
                    );
                    return Err(CoreError::SettlementFailed {
                        execution_id: exec.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// The transactional unit: execution row, buyer leg, seller leg,
    /// analytics rows, settled mark. Either everything applies or
    /// nothing does. Returns `None` when the execution was already
    /// settled.
    async fn try_settle(
        &self,
        exec: &Execution,
    ) -> Result<Option<(Transaction, Transaction)>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT settlement_status FROM executions WHERE id = ?1")
                .bind(exec.id)
                .fetch_optional(&mut *tx)
                .await?;
        if status.as_deref() == Some(STATUS_SETTLED) {
            return Ok(None);
        }
        if status.is_none() {
            self.insert_execution(&mut tx, exec).await?;
        }

        let buy_tx = apply_trade_conn(
            &mut tx,
            exec.buyer,
            &exec.symbol,
            exec.qty,
            exec.price,
            None,
        )
        .await?;
        let sell_tx = apply_trade_conn(
            &mut tx,
            exec.seller,
            &exec.symbol,
            -exec.qty,
            exec.price,
            None,
        )
        .await?;

        AnalyticsRecorder::record_execution_conn(&mut tx, exec).await?;

        sqlx::query("UPDATE executions SET settlement_status = ?1 WHERE id = ?2")
            .bind(STATUS_SETTLED)
            .bind(exec.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(
            "Settled execution {}: {} {} @ {:.2}",
            exec.id,
            exec.symbol,
            exec.qty,
            exec.price
        );
        Ok(Some((buy_tx, sell_tx)))
    }

    /// Post-commit effects: price impact with the aggressor direction,
    /// then the event fan-out. A price-engine failure here is a
    /// cross-store divergence; it is surfaced in the log but the settled
    /// legs are not rolled back.
    async fn apply_downstream(&self, exec: &Execution, buy_tx: &Transaction, sell_tx: &Transaction) {
        if let Err(e) = self
            .price
            .apply_trade(&exec.symbol, exec.qty, exec.aggressor_is_buy)
            .await
        {
            tracing::error!(
                "Price apply diverged for settled execution {}: {}",
                exec.id,
                e
            );
        }

        let ts = Utc::now().timestamp_millis();
        for (order_id, side, investor) in [
            (exec.buy_order_id, OrderSide::Buy, exec.buyer),
            (exec.sell_order_id, OrderSide::Sell, exec.seller),
        ] {
            self.bus.publish(Event::Market(MarketEvent {
                kind: EventKind::OrderExecuted,
                order_id,
                symbol: exec.symbol.clone(),
                side,
                qty: exec.qty,
                price: exec.price,
                investor,
                ts,
            }));
        }

        for (investor, record) in [(exec.buyer, buy_tx), (exec.seller, sell_tx)] {
            if let Ok(balance) = self.balance_of(investor).await {
                self.bus
                    .publish(balance_updated_event(investor, balance, "settlement"));
            }
            self.bus.publish(new_transaction_event(record));
        }
    }

    async fn balance_of(&self, investor: Uuid) -> Result<f64, CoreError> {
        Ok(
            sqlx::query_scalar("SELECT balance FROM investors WHERE id = ?1")
                .bind(investor)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn insert_execution(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        exec: &Execution,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, buy_order_id, sell_order_id, symbol, qty, price, buyer, seller, aggressor_is_buy, settlement_status, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(exec.id)
        .bind(exec.buy_order_id)
        .bind(exec.sell_order_id)
        .bind(&exec.symbol)
        .bind(exec.qty)
        .bind(exec.price)
        .bind(exec.buyer)
        .bind(exec.seller)
        .bind(exec.aggressor_is_buy)
        .bind(exec.ts)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Record the failure and emit the compensation event so operators
    /// can detect and repair the divergence.
    async fn mark_failed(&self, exec: &Execution, cause: &CoreError) {
        let result = async {
            let mut tx = self.pool.begin().await?;
            self.insert_execution(&mut tx, exec).await?;
            sqlx::query("UPDATE executions SET settlement_status = ?1 WHERE id = ?2")
                .bind(STATUS_FAILED)
                .bind(exec.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<(), CoreError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::error!(
                "Could not record settlement failure for execution {}: {}",
                exec.id,
                e
            );
        }

        self.bus.publish(Event::Custom(CustomEvent {
            kind: STATUS_FAILED.to_string(),
            data: serde_json::json!({
                "execution_id": exec.id,
                "symbol": exec.symbol,
                "qty": exec.qty,
                "price": exec.price,
                "buyer": exec.buyer,
                "seller": exec.seller,
                "reason": cause.to_string(),
            }),
            ts: Utc::now().timestamp_millis(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::services::portfolio::PortfolioStore;

    struct Harness {
        pool: SqlitePool,
        bus: EventBus,
        portfolio: PortfolioStore,
        price: Arc<PriceEngine>,
        settlement: SettlementCoordinator,
    }

    async fn harness() -> Harness {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        let bus = EventBus::new(256);
        let price = Arc::new(PriceEngine::new(db.pool.clone(), bus.clone(), 0.001));
        price.initialize_stock("AAPL", 150.0, None).await.unwrap();
        Harness {
            settlement: SettlementCoordinator::new(db.pool.clone(), price.clone(), bus.clone()),
            portfolio: PortfolioStore::new(db.pool.clone(), bus.clone()),
            pool: db.pool,
            bus,
            price,
        }
    }

    fn execution(buyer: Uuid, seller: Uuid, qty: i64, price: f64) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            symbol: "AAPL".to_string(),
            qty,
            price,
            buyer,
            seller,
            aggressor_is_buy: true,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn settles_both_legs_atomically() {
        let h = harness().await;
        let buyer = h.portfolio.register("A", "a@example.com", 10_000.0).await.unwrap();
        // Seller seeded with 100 AAPL @ 140; the seed buy consumes the
        // starting balance.
        let seller = h.portfolio.register("B", "b@example.com", 14_000.0).await.unwrap();
        h.portfolio
            .apply_trade(seller.id, "AAPL", 100, 140.0, None)
            .await
            .unwrap();

        let exec = execution(buyer.id, seller.id, 10, 151.0);
        h.settlement.settle(&exec).await.unwrap();

        let buyer_after = h.portfolio.get(buyer.id).await.unwrap();
        let seller_after = h.portfolio.get(seller.id).await.unwrap();
        assert!((buyer_after.balance - 8_490.0).abs() < 1e-9);
        assert!((seller_after.balance - 1_510.0).abs() < 1e-9);

        // Cash conservation across the pair.
        let delta_buyer = buyer_after.balance - 10_000.0;
        let delta_seller = seller_after.balance - 0.0;
        assert!((delta_buyer + delta_seller).abs() < 1e-9);

        let status: String =
            sqlx::query_scalar("SELECT settlement_status FROM executions WHERE id = ?1")
                .bind(exec.id)
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(status, "SETTLED");

        // Two analytics perspectives.
        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM analytics_trades WHERE trade_id = ?1")
                .bind(exec.id)
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(rows, 2);

        // Buy aggressor pushed the price up.
        assert!(h.price.get_price("AAPL").await.unwrap().current > 150.0);
    }

    #[tokio::test]
    async fn settle_is_idempotent_on_execution_id() {
        let h = harness().await;
        let buyer = h.portfolio.register("A", "a@example.com", 10_000.0).await.unwrap();
        let seller = h.portfolio.register("B", "b@example.com", 14_000.0).await.unwrap();
        h.portfolio
            .apply_trade(seller.id, "AAPL", 100, 140.0, None)
            .await
            .unwrap();

        let exec = execution(buyer.id, seller.id, 10, 151.0);
        h.settlement.settle(&exec).await.unwrap();
        h.settlement.settle(&exec).await.unwrap();

        // The second settle is a no-op.
        let buyer_after = h.portfolio.get(buyer.id).await.unwrap();
        assert!((buyer_after.balance - 8_490.0).abs() < 1e-9);
        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM analytics_trades WHERE trade_id = ?1")
                .bind(exec.id)
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn failed_leg_rolls_back_and_marks_execution() {
        let h = harness().await;
        // Buyer cannot afford the leg; seller holds the shares.
        let buyer = h.portfolio.register("A", "a@example.com", 10.0).await.unwrap();
        let seller = h.portfolio.register("B", "b@example.com", 20_000.0).await.unwrap();
        h.portfolio
            .apply_trade(seller.id, "AAPL", 100, 140.0, None)
            .await
            .unwrap();

        let mut stream = h.bus.subscribe(EventFilter::all().with_kinds(["SETTLEMENT_FAILED"]));

        let exec = execution(buyer.id, seller.id, 10, 151.0);
        let err = h.settlement.settle(&exec).await.unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_FAILED");

        // Neither leg applied.
        assert_eq!(h.portfolio.get(buyer.id).await.unwrap().balance, 10.0);
        let seller_qty: i64 =
            sqlx::query_scalar("SELECT qty FROM portfolio WHERE investor = ?1 AND symbol = 'AAPL'")
                .bind(seller.id)
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(seller_qty, 100);

        let status: String =
            sqlx::query_scalar("SELECT settlement_status FROM executions WHERE id = ?1")
                .bind(exec.id)
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(status, "SETTLEMENT_FAILED");

        // Compensation event published.
        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind_str(), "SETTLEMENT_FAILED");

        // No price impact for a failed settlement.
        assert_eq!(h.price.get_price("AAPL").await.unwrap().current, 150.0);
    }

    #[tokio::test]
    async fn publishes_executed_pair_and_balance_updates() {
        let h = harness().await;
        let buyer = h.portfolio.register("A", "a@example.com", 10_000.0).await.unwrap();
        let seller = h.portfolio.register("B", "b@example.com", 20_000.0).await.unwrap();
        h.portfolio
            .apply_trade(seller.id, "AAPL", 100, 140.0, None)
            .await
            .unwrap();

        let mut executed = h.bus.subscribe(EventFilter::all().with_kinds(["ORDER_EXECUTED"]));
        let mut balances = h.bus.subscribe(EventFilter::all().with_kinds(["BALANCE_UPDATED"]));
        let mut txs = h.bus.subscribe(EventFilter::all().with_kinds(["NEW_TRANSACTION"]));

        let exec = execution(buyer.id, seller.id, 10, 151.0);
        h.settlement.settle(&exec).await.unwrap();

        for _ in 0..2 {
            assert_eq!(executed.recv().await.unwrap().kind_str(), "ORDER_EXECUTED");
            assert_eq!(balances.recv().await.unwrap().kind_str(), "BALANCE_UPDATED");
            assert_eq!(txs.recv().await.unwrap().kind_str(), "NEW_TRANSACTION");
        }
    }
}
