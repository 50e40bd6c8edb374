//! Matching engine.
//!
//! Owns every order book and the `orders` table. All work against one
//! symbol happens under that symbol's async mutex; the market service
//! holds the same gate across admit + settlement so that settlement
//! finishes before the next admit on the symbol. Operations across
//! symbols run in parallel.

use chrono::Utc;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::book::OrderBook;
use super::types::{AdmitResult, BookOrder};
use crate::errors::CoreError;
use crate::events::{Event, EventBus, EventKind, MarketEvent};
use crate::metrics::names;
use crate::models::{Order, OrderBookSnapshot, OrderStatus, OrderStatusResponse};

/// Engine-side record of every order seen this process lifetime.
/// Serves status queries and duplicate-id rejection without touching a
/// book gate.
#[derive(Debug, Clone)]
struct OrderRecord {
    snapshot: Order,
    /// Sum of `qty * price` over fills, for the average fill price.
    notional_filled: f64,
}

pub struct MatchingEngine {
    books: DashMap<String, Arc<Mutex<OrderBook>>>,
    records: DashMap<Uuid, OrderRecord>,
    seq: AtomicU64,
    bus: EventBus,
    pool: SqlitePool,
}

impl MatchingEngine {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self {
            books: DashMap::new(),
            records: DashMap::new(),
            seq: AtomicU64::new(0),
            bus,
            pool,
        }
    }

    /// The serialization gate for a symbol. Lock it to admit, cancel,
    /// read depth, or drive settlement for that symbol.
    pub fn book(&self, symbol: &str) -> Arc<Mutex<OrderBook>> {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(symbol.to_string()))))
            .clone()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Admit a pre-validated order into the (already locked) book:
    /// publish `ORDER_PLACED`, insert, uncross. The caller keeps holding
    /// the gate until every produced execution has settled.
    pub async fn admit(
        &self,
        book: &mut OrderBook,
        order: Order,
    ) -> Result<AdmitResult, CoreError> {
        if self.records.contains_key(&order.id) {
            return Err(CoreError::Conflict(format!(
                "duplicate order id {}",
                order.id
            )));
        }

        let started = Instant::now();
        self.records.insert(
            order.id,
            OrderRecord {
                snapshot: order.clone(),
                notional_filled: 0.0,
            },
        );

        self.bus.publish(Event::Market(MarketEvent {
            kind: EventKind::OrderPlaced,
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            price: order.limit_price,
            investor: order.investor,
            ts: Utc::now().timestamp_millis(),
        }));
        metrics::counter!(names::ORDERS_PLACED_TOTAL).increment(1);

        let order_id = order.id;
        book.insert(BookOrder {
            seq: self.next_seq(),
            order,
        });

        let (executions, touched) = book.uncross();

        for exec in &executions {
            for (id, price) in [(exec.buy_order_id, exec.price), (exec.sell_order_id, exec.price)] {
                if let Some(mut record) = self.records.get_mut(&id) {
                    record.notional_filled += exec.qty as f64 * price;
                }
            }
        }
        for (id, snapshot) in &touched {
            if let Some(mut record) = self.records.get_mut(id) {
                record.snapshot = snapshot.clone();
            }
        }
        metrics::counter!(names::EXECUTIONS_TOTAL).increment(executions.len() as u64);
        metrics::histogram!(names::ORDER_MATCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        let order_snapshot = self
            .records
            .get(&order_id)
            .map(|r| r.snapshot.clone())
            .expect("record inserted above");

        // Persist the admitted order and every counterparty it touched.
        // Idempotent on id: a replayed admit never double-inserts.
        self.upsert_order(&order_snapshot).await?;
        let mut counterparties = Vec::new();
        for (id, snapshot) in touched {
            if id != order_id {
                self.upsert_order(&snapshot).await?;
                counterparties.push(snapshot);
            }
        }

        Ok(AdmitResult {
            order: order_snapshot,
            executions,
            counterparties,
        })
    }

    /// Cancel a live order. Fails if the order is unknown, not owned by
    /// `investor`, or already terminal. Removes it from the book,
    /// synchronizes the store row, and publishes `ORDER_CANCELED`.
    pub async fn cancel(&self, order_id: Uuid, investor: Uuid) -> Result<Order, CoreError> {
        let symbol = {
            let record = self
                .records
                .get(&order_id)
                .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
            if record.snapshot.investor != investor {
                return Err(CoreError::Validation(
                    "order is not owned by this investor".to_string(),
                ));
            }
            if record.snapshot.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "order {} is already {}",
                    order_id, record.snapshot.status
                )));
            }
            record.snapshot.symbol.clone()
        };

        let book = self.book(&symbol);
        let mut book = book.lock().await;

        let mut entry = book.remove(order_id).ok_or_else(|| {
            // Raced with a fill that terminalized the order.
            CoreError::Conflict(format!("order {} is no longer live", order_id))
        })?;
        entry.order.status = OrderStatus::Canceled;
        entry.order.updated_at = Utc::now();

        if let Some(mut record) = self.records.get_mut(&order_id) {
            record.snapshot = entry.order.clone();
        }
        self.upsert_order(&entry.order).await?;

        self.bus.publish(Event::Market(MarketEvent {
            kind: EventKind::OrderCanceled,
            order_id,
            symbol: entry.order.symbol.clone(),
            side: entry.order.side,
            qty: entry.order.remaining(),
            price: entry.order.limit_price,
            investor,
            ts: Utc::now().timestamp_millis(),
        }));
        metrics::counter!(names::ORDERS_CANCELED_TOTAL).increment(1);

        tracing::info!("Order canceled: id={}, symbol={}", order_id, symbol);
        Ok(entry.order)
    }

    /// Status from the in-process registry. Orders from before the last
    /// restart are served from the store by the market service.
    pub fn order_status(&self, order_id: Uuid) -> Option<OrderStatusResponse> {
        self.records.get(&order_id).map(|record| {
            let o = &record.snapshot;
            OrderStatusResponse {
                order_id: o.id,
                symbol: o.symbol.clone(),
                side: o.side,
                status: o.status,
                qty: o.qty,
                filled: o.filled,
                remaining: o.remaining(),
                avg_price: if o.filled > 0 {
                    record.notional_filled / o.filled as f64
                } else {
                    0.0
                },
            }
        })
    }

    pub async fn depth(&self, symbol: &str) -> OrderBookSnapshot {
        let book = self.book(symbol);
        let book = book.lock().await;
        let (bids, asks) = book.depth();
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids,
            asks,
            ts: Utc::now().timestamp_millis(),
        }
    }

    /// Reload live orders into the books after a restart, oldest first
    /// so time priority survives. No events are published and no
    /// matching runs: a consistent store never persists a crossed book.
    pub async fn recover(&self) -> Result<usize, CoreError> {
        let rows: Vec<Order> = sqlx::query_as(
            "SELECT * FROM orders WHERE status IN ('PENDING', 'PARTIALLY_FILLED') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let count = rows.len();
        for order in rows {
            // Fills before the restart settle at an unknown mix of
            // prices; approximate the notional with the limit price.
            self.records.insert(
                order.id,
                OrderRecord {
                    snapshot: order.clone(),
                    notional_filled: order.filled as f64 * order.limit_price,
                },
            );
            let book = self.book(&order.symbol);
            let mut book = book.lock().await;
            book.insert(BookOrder {
                seq: self.next_seq(),
                order,
            });
        }
        Ok(count)
    }

    async fn upsert_order(&self, order: &Order) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, investor, symbol, side, qty, limit_price, filled, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (id) DO UPDATE SET
                filled = excluded.filled,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(order.id)
        .bind(order.investor)
        .bind(&order.symbol)
        .bind(order.side)
        .bind(order.qty)
        .bind(order.limit_price)
        .bind(order.filled)
        .bind(order.status)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist an order that never reached a book (the rejection path).
    pub async fn persist_rejected(&self, order: &Order) -> Result<(), CoreError> {
        metrics::counter!(names::ORDERS_REJECTED_TOTAL).increment(1);
        self.upsert_order(order).await
    }
}
