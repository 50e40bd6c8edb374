//! Database access.
//!
//! The shared state surface is a single on-disk SQLite file. Each table
//! has exactly one owning service; cross-owner reads are allowed,
//! cross-owner writes are not.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open (creating if necessary) the database file and bootstrap the
    /// schema. `sqlite::memory:` is accepted for tests; a memory
    /// database is pinned to a single pooled connection, since every
    /// connection would otherwise open its own empty database.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !is_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 8 })
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        // Owners: matching engine -> orders, executions; portfolio ->
        // investors, portfolio, transactions; price -> stocks,
        // price_history; analytics -> analytics_trades; webhooks ->
        // webhooks.
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS stocks (
                symbol       TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                current      REAL NOT NULL,
                open         REAL NOT NULL,
                high         REAL NOT NULL,
                low          REAL NOT NULL,
                volume       INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id          TEXT PRIMARY KEY,
                investor    TEXT NOT NULL,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL,
                qty         INTEGER NOT NULL,
                limit_price REAL NOT NULL,
                filled      INTEGER NOT NULL DEFAULT 0,
                status      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id                TEXT PRIMARY KEY,
                buy_order_id      TEXT NOT NULL,
                sell_order_id     TEXT NOT NULL,
                symbol            TEXT NOT NULL,
                qty               INTEGER NOT NULL,
                price             REAL NOT NULL,
                buyer             TEXT NOT NULL,
                seller            TEXT NOT NULL,
                aggressor_is_buy  INTEGER NOT NULL,
                settlement_status TEXT NOT NULL DEFAULT 'PENDING',
                ts                TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS investors (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                email      TEXT NOT NULL UNIQUE,
                balance    REAL NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS portfolio (
                investor  TEXT NOT NULL,
                symbol    TEXT NOT NULL,
                qty       INTEGER NOT NULL,
                avg_price REAL NOT NULL,
                PRIMARY KEY (investor, symbol)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id       TEXT PRIMARY KEY,
                investor TEXT NOT NULL,
                symbol   TEXT NOT NULL,
                tx_type  TEXT NOT NULL,
                qty      INTEGER NOT NULL,
                price    REAL NOT NULL,
                total    REAL NOT NULL,
                ts       TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS price_history (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                price  REAL NOT NULL,
                ts     TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS analytics_trades (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id     TEXT NOT NULL,
                symbol       TEXT NOT NULL,
                side         TEXT NOT NULL,
                qty          INTEGER NOT NULL,
                price        REAL NOT NULL,
                investor     TEXT NOT NULL,
                counterparty TEXT NOT NULL,
                ts           TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                id         TEXT PRIMARY KEY,
                url        TEXT NOT NULL,
                events     TEXT NOT NULL,
                active     INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_price_history_symbol_ts ON price_history (symbol, ts)",
            "CREATE INDEX IF NOT EXISTS idx_portfolio_investor ON portfolio (investor)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_investor_ts ON transactions (investor, ts)",
            "CREATE INDEX IF NOT EXISTS idx_orders_investor_status ON orders (investor, status)",
            "CREATE INDEX IF NOT EXISTS idx_analytics_trades_symbol_ts ON analytics_trades (symbol, ts)",
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        tracing::debug!("Database schema ready");
        Ok(())
    }
}
