//! Analytics recorder.
//!
//! Owns the append-only `analytics_trades` table (one row per
//! counterparty perspective of each execution) and computes every
//! derived view on query: rankings, market stats, investor performance,
//! naive price prediction, volume buckets.

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::events::{CustomEvent, Event, EventBus};
use crate::models::{
    InvestorPerformance, MarketSentiment, MarketStats, OrderSide, PricePrediction, PriceTrend,
    RiskLevel, SymbolPerformance, TopTradedEntry, TradeRecord, VolatilityEntry, VolumeBucket,
};
use crate::services::matching::Execution;

/// Price points fed into the prediction regression.
const REGRESSION_POINTS: i64 = 20;

pub struct AnalyticsRecorder {
    pool: SqlitePool,
    bus: EventBus,
}

impl AnalyticsRecorder {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Record a single trade row (the `RecordTrade` surface).
    pub async fn record_trade(&self, record: &TradeRecord) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_trade_row(&mut conn, record).await
    }

    /// Both perspectives of an execution, on the settlement transaction.
    pub async fn record_execution_conn(
        conn: &mut SqliteConnection,
        exec: &Execution,
    ) -> Result<(), CoreError> {
        for record in execution_perspectives(exec) {
            insert_trade_row(conn, &record).await?;
        }
        Ok(())
    }

    /// Symbols ranked by traded quantity over the window, trade count as
    /// the tie-break.
    pub async fn top_traded(
        &self,
        limit: i64,
        window: Duration,
    ) -> Result<Vec<TopTradedEntry>, CoreError> {
        let since = Utc::now() - window;
        // The BUY perspective counts each execution exactly once.
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT symbol, SUM(qty) AS total_qty, COUNT(*) AS trade_count
            FROM analytics_trades
            WHERE side = 'BUY' AND ts >= ?1
            GROUP BY symbol
            ORDER BY total_qty DESC, trade_count DESC
            LIMIT ?2
            "#,
        )
        .bind(since)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(symbol, total_qty, trade_count)| TopTradedEntry {
                symbol,
                total_qty,
                trade_count,
            })
            .collect())
    }

    /// Symbols ranked by `(max - min) / avg * 100` over the window's
    /// price history.
    pub async fn most_volatile(
        &self,
        limit: i64,
        window: Duration,
    ) -> Result<Vec<VolatilityEntry>, CoreError> {
        let since = Utc::now() - window;
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"
            SELECT symbol, (MAX(price) - MIN(price)) / AVG(price) * 100.0 AS volatility
            FROM price_history
            WHERE ts >= ?1
            GROUP BY symbol
            ORDER BY volatility DESC
            LIMIT ?2
            "#,
        )
        .bind(since)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(symbol, volatility_pct)| VolatilityEntry {
                symbol,
                volatility_pct,
            })
            .collect())
    }

    /// Totals over the last 24 hours plus the market-wide trend.
    pub async fn market_stats(&self) -> Result<MarketStats, CoreError> {
        let since = Utc::now() - Duration::hours(24);

        let (total_trades, total_volume): (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT trade_id), SUM(CASE WHEN side = 'BUY' THEN qty ELSE 0 END)
            FROM analytics_trades
            WHERE ts >= ?1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let (active_investors, active_symbols): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(DISTINCT investor), COUNT(DISTINCT symbol) FROM analytics_trades WHERE ts >= ?1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let trend: Option<f64> = sqlx::query_scalar("SELECT AVG(current - open) FROM stocks")
            .fetch_one(&self.pool)
            .await?;
        let trend = trend.unwrap_or(0.0);

        let sentiment = if trend > 0.5 {
            MarketSentiment::Bullish
        } else if trend < -0.5 {
            MarketSentiment::Bearish
        } else {
            MarketSentiment::Neutral
        };

        Ok(MarketStats {
            total_trades,
            total_volume: total_volume.unwrap_or(0),
            active_investors,
            active_symbols,
            trend,
            sentiment,
        })
    }

    /// Realized P&L from matched BUY/SELL runs (average-cost basis),
    /// unrealized P&L from live holdings at the supplied quotes, win
    /// rate over realized sells, and a coarse risk banding.
    pub async fn investor_performance(
        &self,
        investor: Uuid,
        quotes: &HashMap<String, f64>,
    ) -> Result<InvestorPerformance, CoreError> {
        let rows: Vec<(String, OrderSide, i64, f64)> = sqlx::query_as(
            r#"
            SELECT symbol, side, qty, price FROM analytics_trades
            WHERE investor = ?1
            ORDER BY ts, id
            "#,
        )
        .bind(investor)
        .fetch_all(&self.pool)
        .await?;

        struct Basis {
            qty: i64,
            avg: f64,
            realized: f64,
            trades: i64,
        }

        let mut per_symbol: HashMap<String, Basis> = HashMap::new();
        let mut wins = 0i64;
        let mut losses = 0i64;
        let mut total_notional = 0.0;
        let trade_count = rows.len() as i64;

        for (symbol, side, qty, price) in rows {
            total_notional += qty as f64 * price;
            let basis = per_symbol.entry(symbol).or_insert(Basis {
                qty: 0,
                avg: 0.0,
                realized: 0.0,
                trades: 0,
            });
            basis.trades += 1;
            match side {
                OrderSide::Buy => {
                    let new_qty = basis.qty + qty;
                    basis.avg = (basis.qty as f64 * basis.avg + qty as f64 * price)
                        / new_qty.max(1) as f64;
                    basis.qty = new_qty;
                }
                OrderSide::Sell => {
                    // Sells beyond the recorded basis (seeded holdings)
                    // realize against a zero-cost basis.
                    let matched = qty.min(basis.qty.max(0));
                    let pnl = (price - basis.avg) * matched as f64
                        + price * (qty - matched) as f64;
                    basis.realized += pnl;
                    basis.qty -= qty;
                    if basis.qty <= 0 {
                        basis.qty = basis.qty.max(0);
                        if basis.qty == 0 {
                            basis.avg = 0.0;
                        }
                    }
                    if pnl > 0.0 {
                        wins += 1;
                    } else if pnl < 0.0 {
                        losses += 1;
                    }
                }
            }
        }

        let mut symbols: Vec<SymbolPerformance> = per_symbol
            .into_iter()
            .map(|(symbol, basis)| {
                let quote = quotes.get(&symbol).copied().unwrap_or(basis.avg);
                SymbolPerformance {
                    unrealized_pnl: (quote - basis.avg) * basis.qty as f64,
                    realized_pnl: basis.realized,
                    trade_count: basis.trades,
                    symbol,
                }
            })
            .collect();
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let realized_pnl = symbols.iter().map(|s| s.realized_pnl).sum();
        let unrealized_pnl = symbols.iter().map(|s| s.unrealized_pnl).sum();
        let win_rate = if wins + losses > 0 {
            wins as f64 / (wins + losses) as f64
        } else {
            0.0
        };

        let avg_trade = if trade_count > 0 {
            total_notional / trade_count as f64
        } else {
            0.0
        };
        let risk_level = if avg_trade >= 10_000.0 || trade_count > 50 {
            RiskLevel::High
        } else if avg_trade >= 5_000.0 || trade_count > 20 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        Ok(InvestorPerformance {
            investor,
            per_symbol: symbols,
            realized_pnl,
            unrealized_pnl,
            win_rate,
            risk_level,
            trade_count,
        })
    }

    /// Least-squares fit over the last 20 price points, extrapolated
    /// `horizon/60` steps out. Confidence is `R^2` scaled to 0..100.
    pub async fn predict_price(
        &self,
        symbol: &str,
        horizon_minutes: i64,
    ) -> Result<PricePrediction, CoreError> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            "SELECT price FROM price_history WHERE symbol = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
        )
        .bind(symbol)
        .bind(REGRESSION_POINTS)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(CoreError::NotFound(format!(
                "no price history for {}",
                symbol
            )));
        }

        // Oldest first for the regression.
        let prices: Vec<f64> = rows.into_iter().rev().map(|(p,)| p).collect();
        let current = *prices.last().expect("non-empty");
        let n = prices.len() as f64;

        let mean_x = (n - 1.0) / 2.0;
        let mean_y = prices.iter().sum::<f64>() / n;
        let mut ss_xy = 0.0;
        let mut ss_xx = 0.0;
        let mut ss_yy = 0.0;
        for (i, y) in prices.iter().enumerate() {
            let dx = i as f64 - mean_x;
            let dy = y - mean_y;
            ss_xy += dx * dy;
            ss_xx += dx * dx;
            ss_yy += dy * dy;
        }

        let slope = if ss_xx > 0.0 { ss_xy / ss_xx } else { 0.0 };
        let intercept = mean_y - slope * mean_x;
        let r_squared = if ss_xx > 0.0 && ss_yy > 0.0 {
            (ss_xy * ss_xy) / (ss_xx * ss_yy)
        } else {
            0.0
        };

        let steps = horizon_minutes as f64 / 60.0;
        let predicted = (slope * (n - 1.0 + steps) + intercept).max(0.01);
        let confidence = (r_squared * 100.0).clamp(0.0, 100.0);

        let change_pct = if current > 0.0 {
            (predicted - current) / current * 100.0
        } else {
            0.0
        };
        let trend = if change_pct > 0.5 {
            PriceTrend::Up
        } else if change_pct < -0.5 {
            PriceTrend::Down
        } else {
            PriceTrend::Stable
        };

        let prediction = PricePrediction {
            symbol: symbol.to_string(),
            current_price: current,
            predicted_price: predicted,
            horizon_minutes,
            confidence,
            trend,
        };

        self.bus.publish(Event::Custom(CustomEvent {
            kind: "PREDICTION_AVAILABLE".to_string(),
            data: serde_json::to_value(&prediction).unwrap_or_default(),
            ts: Utc::now().timestamp_millis(),
        }));

        Ok(prediction)
    }

    /// Trades bucketed by `interval_ms`; only non-empty buckets are
    /// returned, oldest first. `avg_price` is volume-weighted.
    pub async fn trading_volume(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        interval_ms: i64,
    ) -> Result<Vec<VolumeBucket>, CoreError> {
        if interval_ms <= 0 {
            return Err(CoreError::Validation(
                "interval must be positive".to_string(),
            ));
        }
        let start = start.unwrap_or(DateTime::UNIX_EPOCH);
        let end = end.unwrap_or_else(Utc::now);

        let rows: Vec<(DateTime<Utc>, i64, f64)> = sqlx::query_as(
            r#"
            SELECT ts, qty, price FROM analytics_trades
            WHERE symbol = ?1 AND side = 'BUY' AND ts >= ?2 AND ts <= ?3
            ORDER BY ts
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut buckets: Vec<VolumeBucket> = Vec::new();
        for (ts, qty, price) in rows {
            let bucket_ts = ts.timestamp_millis() / interval_ms * interval_ms;
            match buckets.last_mut() {
                Some(bucket) if bucket.ts == bucket_ts => {
                    bucket.avg_price = (bucket.avg_price * bucket.volume as f64
                        + price * qty as f64)
                        / (bucket.volume + qty) as f64;
                    bucket.volume += qty;
                    bucket.count += 1;
                }
                _ => buckets.push(VolumeBucket {
                    ts: bucket_ts,
                    volume: qty,
                    count: 1,
                    avg_price: price,
                }),
            }
        }
        Ok(buckets)
    }
}

/// The two analytics rows an execution expands into.
pub fn execution_perspectives(exec: &Execution) -> [TradeRecord; 2] {
    [
        TradeRecord {
            trade_id: exec.id,
            symbol: exec.symbol.clone(),
            side: OrderSide::Buy,
            qty: exec.qty,
            price: exec.price,
            investor: exec.buyer,
            counterparty: exec.seller,
            ts: exec.ts,
        },
        TradeRecord {
            trade_id: exec.id,
            symbol: exec.symbol.clone(),
            side: OrderSide::Sell,
            qty: exec.qty,
            price: exec.price,
            investor: exec.seller,
            counterparty: exec.buyer,
            ts: exec.ts,
        },
    ]
}

async fn insert_trade_row(
    conn: &mut SqliteConnection,
    record: &TradeRecord,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO analytics_trades (trade_id, symbol, side, qty, price, investor, counterparty, ts)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(record.trade_id)
    .bind(&record.symbol)
    .bind(record.side)
    .bind(record.qty)
    .bind(record.price)
    .bind(record.investor)
    .bind(record.counterparty)
    .bind(record.ts)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    async fn recorder() -> AnalyticsRecorder {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        AnalyticsRecorder::new(db.pool, EventBus::new(64))
    }

    fn record(
        symbol: &str,
        side: OrderSide,
        qty: i64,
        price: f64,
        investor: Uuid,
        ts: DateTime<Utc>,
    ) -> TradeRecord {
        TradeRecord {
            trade_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            investor,
            counterparty: Uuid::new_v4(),
            ts,
        }
    }

    #[tokio::test]
    async fn top_traded_ranks_by_qty_then_count() {
        let recorder = recorder().await;
        let now = Utc::now();
        let a = Uuid::new_v4();

        // AAPL: 50 shares over 1 trade; MSFT: 50 over 2; TSLA: 10.
        recorder
            .record_trade(&record("AAPL", OrderSide::Buy, 50, 150.0, a, now))
            .await
            .unwrap();
        for qty in [25, 25] {
            recorder
                .record_trade(&record("MSFT", OrderSide::Buy, qty, 300.0, a, now))
                .await
                .unwrap();
        }
        recorder
            .record_trade(&record("TSLA", OrderSide::Buy, 10, 700.0, a, now))
            .await
            .unwrap();

        let top = recorder.top_traded(10, Duration::hours(1)).await.unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].symbol, "MSFT"); // same qty as AAPL, more trades
        assert_eq!(top[1].symbol, "AAPL");
        assert_eq!(top[2].symbol, "TSLA");
    }

    #[tokio::test]
    async fn window_excludes_old_trades() {
        let recorder = recorder().await;
        let a = Uuid::new_v4();
        recorder
            .record_trade(&record(
                "AAPL",
                OrderSide::Buy,
                50,
                150.0,
                a,
                Utc::now() - Duration::hours(2),
            ))
            .await
            .unwrap();

        let top = recorder.top_traded(10, Duration::hours(1)).await.unwrap();
        assert!(top.is_empty());
    }

    #[tokio::test]
    async fn performance_realized_and_win_rate() {
        let recorder = recorder().await;
        let investor = Uuid::new_v4();
        let t0 = Utc::now() - Duration::minutes(10);

        // Buy 10 @ 100, buy 10 @ 200 (avg 150), sell 10 @ 180 (+300),
        // sell 5 @ 100 (-250).
        for (side, qty, price, offset) in [
            (OrderSide::Buy, 10, 100.0, 0),
            (OrderSide::Buy, 10, 200.0, 1),
            (OrderSide::Sell, 10, 180.0, 2),
            (OrderSide::Sell, 5, 100.0, 3),
        ] {
            recorder
                .record_trade(&record(
                    "AAPL",
                    side,
                    qty,
                    price,
                    investor,
                    t0 + Duration::seconds(offset),
                ))
                .await
                .unwrap();
        }

        let quotes = HashMap::from([("AAPL".to_string(), 160.0)]);
        let perf = recorder
            .investor_performance(investor, &quotes)
            .await
            .unwrap();

        assert_eq!(perf.trade_count, 4);
        assert!((perf.realized_pnl - 50.0).abs() < 1e-9);
        // 5 shares left at avg 150, quoted 160.
        assert!((perf.unrealized_pnl - 50.0).abs() < 1e-9);
        assert!((perf.win_rate - 0.5).abs() < 1e-9);
        assert_eq!(perf.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn risk_bands_on_notional() {
        let recorder = recorder().await;
        let investor = Uuid::new_v4();
        recorder
            .record_trade(&record(
                "AAPL",
                OrderSide::Buy,
                100,
                120.0,
                investor,
                Utc::now(),
            ))
            .await
            .unwrap();

        let perf = recorder
            .investor_performance(investor, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(perf.risk_level, RiskLevel::High); // 12_000 avg notional
    }

    #[tokio::test]
    async fn prediction_follows_linear_history() {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        let recorder = AnalyticsRecorder::new(db.pool.clone(), EventBus::new(64));

        // Strictly increasing prices, one per second.
        let t0 = Utc::now() - Duration::seconds(30);
        for i in 0..25 {
            sqlx::query("INSERT INTO price_history (symbol, price, ts) VALUES ('AAPL', ?1, ?2)")
                .bind(100.0 + i as f64)
                .bind(t0 + Duration::seconds(i))
                .execute(&db.pool)
                .await
                .unwrap();
        }

        let prediction = recorder.predict_price("AAPL", 120).await.unwrap();
        assert_eq!(prediction.trend, PriceTrend::Up);
        assert!(prediction.predicted_price > prediction.current_price);
        // A perfectly linear series fits with full confidence.
        assert!((prediction.confidence - 100.0).abs() < 1e-6);

        assert!(recorder.predict_price("MSFT", 60).await.is_err());
    }

    #[tokio::test]
    async fn volume_buckets_skip_empty_intervals() {
        let recorder = recorder().await;
        let investor = Uuid::new_v4();
        let t0 = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();

        for (qty, price, offset_ms) in [(10, 100.0, 0), (30, 110.0, 500), (5, 120.0, 60_000)] {
            recorder
                .record_trade(&record(
                    "AAPL",
                    OrderSide::Buy,
                    qty,
                    price,
                    investor,
                    t0 + Duration::milliseconds(offset_ms),
                ))
                .await
                .unwrap();
        }

        let buckets = recorder
            .trading_volume("AAPL", Some(t0 - Duration::seconds(1)), Some(Utc::now()), 1_000)
            .await
            .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].volume, 40);
        assert_eq!(buckets[0].count, 2);
        assert!((buckets[0].avg_price - 107.5).abs() < 1e-9);
        assert_eq!(buckets[1].volume, 5);
    }
}
