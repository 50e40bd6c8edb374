//! Portfolio store.
//!
//! Owns the `investors`, `portfolio`, and `transactions` tables. The
//! trade-application helpers run against a caller-supplied connection so
//! the settlement coordinator can put both legs of an execution into one
//! store transaction.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::events::{Event, EventBus};
use crate::models::{
    Holding, Investor, Order, OrderSide, Portfolio, PortfolioPosition, Transaction,
    TransactionQuery,
};

pub struct PortfolioStore {
    pool: SqlitePool,
    bus: EventBus,
}

impl PortfolioStore {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Create an investor with a fresh opaque id.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        initial_balance: f64,
    ) -> Result<Investor, CoreError> {
        if initial_balance < 0.0 {
            return Err(CoreError::Validation(
                "initial balance must not be negative".to_string(),
            ));
        }
        let investor = Investor {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_lowercase(),
            balance: initial_balance,
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO investors (id, name, email, balance, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(investor.id)
        .bind(&investor.name)
        .bind(&investor.email)
        .bind(investor.balance)
        .bind(investor.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::info!("Registered investor {} ({})", investor.id, investor.email);
                Ok(investor)
            }
            Err(e) if is_unique_violation(&e) => Err(CoreError::Conflict(format!(
                "email {} already taken",
                investor.email
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Investor, CoreError> {
        sqlx::query_as::<_, Investor>("SELECT * FROM investors WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("investor {}", id)))
    }

    /// Apply a signed balance delta. Fails without mutating when the
    /// result would be negative.
    pub async fn adjust_balance(
        &self,
        id: Uuid,
        amount: f64,
        reason: &str,
    ) -> Result<Investor, CoreError> {
        let mut conn = self.pool.acquire().await?;
        adjust_balance_conn(&mut conn, id, amount).await?;
        drop(conn);

        let investor = self.get(id).await?;
        self.bus
            .publish(balance_updated_event(id, investor.balance, reason));
        Ok(investor)
    }

    /// Pre-trade affordability / availability check. Never mutates.
    pub async fn validate_order(
        &self,
        investor: Uuid,
        symbol: &str,
        side: OrderSide,
        qty: i64,
        price: f64,
    ) -> Result<(), CoreError> {
        if qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }
        if price < 0.0 {
            return Err(CoreError::Validation(
                "price must not be negative".to_string(),
            ));
        }
        let record = self.get(investor).await?;

        match side {
            OrderSide::Buy => {
                let required = qty as f64 * price;
                if record.balance < required {
                    return Err(CoreError::InsufficientFunds {
                        required,
                        available: record.balance,
                    });
                }
            }
            OrderSide::Sell => {
                let held = self.held_qty(investor, symbol).await?;
                if held < qty {
                    return Err(CoreError::InsufficientShares {
                        required: qty,
                        held,
                    });
                }
            }
        }
        Ok(())
    }

    async fn held_qty(&self, investor: Uuid, symbol: &str) -> Result<i64, CoreError> {
        let qty: Option<i64> =
            sqlx::query_scalar("SELECT qty FROM portfolio WHERE investor = ?1 AND symbol = ?2")
                .bind(investor)
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;
        Ok(qty.unwrap_or(0))
    }

    /// Apply a trade leg in its own transaction and publish the balance
    /// and transaction events. Settlement uses [`apply_trade_conn`]
    /// directly instead, inside its combined transaction.
    pub async fn apply_trade(
        &self,
        investor: Uuid,
        symbol: &str,
        signed_qty: i64,
        price: f64,
        tx_id: Option<Uuid>,
    ) -> Result<Transaction, CoreError> {
        let mut tx = self.pool.begin().await?;
        let record = apply_trade_conn(&mut tx, investor, symbol, signed_qty, price, tx_id).await?;
        tx.commit().await?;

        let investor_row = self.get(investor).await?;
        self.bus
            .publish(balance_updated_event(investor, investor_row.balance, "trade"));
        self.bus.publish(new_transaction_event(&record));
        Ok(record)
    }

    /// Holdings decorated with the current quotes.
    pub async fn portfolio(
        &self,
        id: Uuid,
        prices: &HashMap<String, f64>,
    ) -> Result<Portfolio, CoreError> {
        let investor = self.get(id).await?;
        let holdings: Vec<Holding> =
            sqlx::query_as("SELECT * FROM portfolio WHERE investor = ?1 ORDER BY symbol")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let positions: Vec<PortfolioPosition> = holdings
            .into_iter()
            .map(|h| {
                let current_price = prices.get(&h.symbol).copied().unwrap_or(h.avg_price);
                PortfolioPosition {
                    current_value: h.qty as f64 * current_price,
                    profit_loss: (current_price - h.avg_price) * h.qty as f64,
                    symbol: h.symbol,
                    qty: h.qty,
                    avg_price: h.avg_price,
                    current_price,
                }
            })
            .collect();

        let total_value =
            investor.balance + positions.iter().map(|p| p.current_value).sum::<f64>();
        Ok(Portfolio {
            investor: id,
            balance: investor.balance,
            positions,
            total_value,
        })
    }

    /// Newest-first transaction history.
    pub async fn transactions(
        &self,
        id: Uuid,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>, CoreError> {
        let start = query
            .start
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);
        let end = query
            .end
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let rows: Vec<Transaction> = sqlx::query_as(
            r#"
            SELECT * FROM transactions
            WHERE investor = ?1 AND ts >= ?2 AND ts <= ?3
            ORDER BY ts DESC
            LIMIT ?4
            "#,
        )
        .bind(id)
        .bind(start)
        .bind(end)
        .bind(query.get_limit())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Signed balance delta on one connection. The conditional update keeps
/// concurrent writers from driving a balance negative.
pub async fn adjust_balance_conn(
    conn: &mut SqliteConnection,
    id: Uuid,
    amount: f64,
) -> Result<(), CoreError> {
    let balance: Option<f64> = sqlx::query_scalar("SELECT balance FROM investors WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let balance = balance.ok_or_else(|| CoreError::NotFound(format!("investor {}", id)))?;

    let updated = sqlx::query(
        "UPDATE investors SET balance = balance + ?1 WHERE id = ?2 AND balance + ?1 >= 0",
    )
    .bind(amount)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::InsufficientFunds {
            required: -amount,
            available: balance,
        });
    }
    Ok(())
}

/// One trade leg: cash move, holding update (weighted-average buy
/// price on buys, untouched average on sells), transaction append.
/// Positive `signed_qty` buys, negative sells.
pub async fn apply_trade_conn(
    conn: &mut SqliteConnection,
    investor: Uuid,
    symbol: &str,
    signed_qty: i64,
    price: f64,
    tx_id: Option<Uuid>,
) -> Result<Transaction, CoreError> {
    if signed_qty == 0 {
        return Err(CoreError::Validation("qty must be non-zero".to_string()));
    }
    if price < 0.0 {
        return Err(CoreError::Validation(
            "price must not be negative".to_string(),
        ));
    }

    let qty = signed_qty.abs();
    let total = qty as f64 * price;

    let holding: Option<Holding> =
        sqlx::query_as("SELECT * FROM portfolio WHERE investor = ?1 AND symbol = ?2")
            .bind(investor)
            .bind(symbol)
            .fetch_optional(&mut *conn)
            .await?;

    let tx_type = if signed_qty > 0 {
        adjust_balance_conn(&mut *conn, investor, -total).await?;

        let (old_qty, old_avg) = holding.map(|h| (h.qty, h.avg_price)).unwrap_or((0, 0.0));
        let new_qty = old_qty + qty;
        let new_avg = (old_qty as f64 * old_avg + total) / new_qty as f64;

        sqlx::query(
            r#"
            INSERT INTO portfolio (investor, symbol, qty, avg_price)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (investor, symbol) DO UPDATE SET
                qty = excluded.qty,
                avg_price = excluded.avg_price
            "#,
        )
        .bind(investor)
        .bind(symbol)
        .bind(new_qty)
        .bind(new_avg)
        .execute(&mut *conn)
        .await?;
        OrderSide::Buy
    } else {
        let held = holding.as_ref().map(|h| h.qty).unwrap_or(0);
        if held < qty {
            return Err(CoreError::InsufficientShares {
                required: qty,
                held,
            });
        }

        if held == qty {
            sqlx::query("DELETE FROM portfolio WHERE investor = ?1 AND symbol = ?2")
                .bind(investor)
                .bind(symbol)
                .execute(&mut *conn)
                .await?;
        } else {
            sqlx::query(
                "UPDATE portfolio SET qty = qty - ?1 WHERE investor = ?2 AND symbol = ?3",
            )
            .bind(qty)
            .bind(investor)
            .bind(symbol)
            .execute(&mut *conn)
            .await?;
        }

        adjust_balance_conn(&mut *conn, investor, total).await?;
        OrderSide::Sell
    };

    let record = Transaction {
        id: tx_id.unwrap_or_else(Uuid::new_v4),
        investor,
        symbol: symbol.to_string(),
        tx_type,
        qty,
        price,
        total,
        ts: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO transactions (id, investor, symbol, tx_type, qty, price, total, ts)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(record.id)
    .bind(record.investor)
    .bind(&record.symbol)
    .bind(record.tx_type)
    .bind(record.qty)
    .bind(record.price)
    .bind(record.total)
    .bind(record.ts)
    .execute(&mut *conn)
    .await?;

    Ok(record)
}

pub fn balance_updated_event(investor: Uuid, balance: f64, reason: &str) -> Event {
    Event::Custom(crate::events::CustomEvent {
        kind: "BALANCE_UPDATED".to_string(),
        data: serde_json::json!({
            "investor": investor,
            "balance": balance,
            "reason": reason,
        }),
        ts: Utc::now().timestamp_millis(),
    })
}

pub fn new_transaction_event(tx: &Transaction) -> Event {
    Event::Custom(crate::events::CustomEvent {
        kind: "NEW_TRANSACTION".to_string(),
        data: serde_json::to_value(tx).unwrap_or_default(),
        ts: Utc::now().timestamp_millis(),
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Pre-validate an order against balances and holdings, resolving a
/// market order's zero limit to the supplied quote.
pub async fn validate_with_quote(
    store: &PortfolioStore,
    order: &Order,
    quote: f64,
) -> Result<(), CoreError> {
    let effective_price = if order.is_market() {
        quote
    } else {
        order.limit_price
    };
    store
        .validate_order(
            order.investor,
            &order.symbol,
            order.side,
            order.qty,
            effective_price,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PortfolioStore {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        PortfolioStore::new(db.pool, EventBus::new(64))
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let store = store().await;
        let investor = store
            .register("Alice", "alice@example.com", 10_000.0)
            .await
            .unwrap();

        let fetched = store.get(investor.id).await.unwrap();
        assert_eq!(fetched.id, investor.id);
        assert_eq!(fetched.email, "alice@example.com");
        assert_eq!(fetched.balance, 10_000.0);
    }

    #[tokio::test]
    async fn duplicate_email_is_conflict() {
        let store = store().await;
        store.register("A", "a@example.com", 0.0).await.unwrap();
        let err = store.register("B", "A@example.com", 0.0).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn balance_never_goes_negative() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 100.0).await.unwrap();

        let err = store
            .adjust_balance(investor.id, -150.0, "test")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(store.get(investor.id).await.unwrap().balance, 100.0);

        let after = store.adjust_balance(investor.id, -40.0, "test").await.unwrap();
        assert_eq!(after.balance, 60.0);
    }

    #[tokio::test]
    async fn weighted_average_on_buys_unchanged_on_sells() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 100_000.0).await.unwrap();

        store
            .apply_trade(investor.id, "AAPL", 10, 100.0, None)
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", 10, 200.0, None)
            .await
            .unwrap();

        let holding: Holding =
            sqlx::query_as("SELECT * FROM portfolio WHERE investor = ?1 AND symbol = 'AAPL'")
                .bind(investor.id)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(holding.qty, 20);
        assert!((holding.avg_price - 150.0).abs() < 1e-9);

        store
            .apply_trade(investor.id, "AAPL", -5, 300.0, None)
            .await
            .unwrap();
        let holding: Holding =
            sqlx::query_as("SELECT * FROM portfolio WHERE investor = ?1 AND symbol = 'AAPL'")
                .bind(investor.id)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(holding.qty, 15);
        assert!((holding.avg_price - 150.0).abs() < 1e-9, "sells keep the average");
    }

    #[tokio::test]
    async fn holding_deleted_at_zero() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 10_000.0).await.unwrap();

        store
            .apply_trade(investor.id, "AAPL", 10, 100.0, None)
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", -10, 100.0, None)
            .await
            .unwrap();

        let holding: Option<Holding> =
            sqlx::query_as("SELECT * FROM portfolio WHERE investor = ?1 AND symbol = 'AAPL'")
                .bind(investor.id)
                .fetch_optional(store.pool())
                .await
                .unwrap();
        assert!(holding.is_none());
        // Buy then sell at the same price leaves cash unchanged.
        assert_eq!(store.get(investor.id).await.unwrap().balance, 10_000.0);
    }

    #[tokio::test]
    async fn sell_without_shares_fails() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 1_000.0).await.unwrap();
        let err = store
            .apply_trade(investor.id, "AAPL", -10, 100.0, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_SHARES");
    }

    #[tokio::test]
    async fn validate_order_checks_both_sides() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 100.0).await.unwrap();

        let err = store
            .validate_order(investor.id, "AAPL", OrderSide::Buy, 10, 150.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");

        store
            .validate_order(investor.id, "AAPL", OrderSide::Buy, 1, 50.0)
            .await
            .unwrap();

        let err = store
            .validate_order(investor.id, "AAPL", OrderSide::Sell, 1, 50.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_SHARES");

        // Validation never mutates.
        assert_eq!(store.get(investor.id).await.unwrap().balance, 100.0);
    }

    #[tokio::test]
    async fn portfolio_decorated_with_quotes() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 10_000.0).await.unwrap();
        store
            .apply_trade(investor.id, "AAPL", 10, 150.0, None)
            .await
            .unwrap();

        let mut prices = HashMap::new();
        prices.insert("AAPL".to_string(), 160.0);
        let portfolio = store.portfolio(investor.id, &prices).await.unwrap();

        assert_eq!(portfolio.positions.len(), 1);
        let pos = &portfolio.positions[0];
        assert_eq!(pos.current_value, 1_600.0);
        assert!((pos.profit_loss - 100.0).abs() < 1e-9);
        assert_eq!(portfolio.balance, 8_500.0);
        assert_eq!(portfolio.total_value, 10_100.0);
    }

    #[tokio::test]
    async fn transactions_newest_first_with_limit() {
        let store = store().await;
        let investor = store.register("A", "a@example.com", 100_000.0).await.unwrap();
        for i in 0..5 {
            store
                .apply_trade(investor.id, "AAPL", 1, 100.0 + i as f64, None)
                .await
                .unwrap();
        }

        let txs = store
            .transactions(
                investor.id,
                &TransactionQuery {
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(txs.len(), 3);
        assert!(txs.windows(2).all(|w| w[0].ts >= w[1].ts));
    }
}
