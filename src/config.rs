//! Application configuration.
//!
//! Every key is optional and comes from the environment (a `.env` file
//! is honored via dotenvy before this runs).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen port.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[serde(default = "defaults::database_path")]
    pub database_path: String,

    /// Stocks created at boot: `SYM:PRICE:NAME,SYM:PRICE:NAME,...`
    /// The name segment is optional.
    #[serde(default = "defaults::initial_stocks")]
    pub initial_stocks: String,

    /// Volatility constant of the synthetic price model.
    #[serde(default = "defaults::price_volatility_factor")]
    pub price_volatility_factor: f64,

    /// UTC hour at which the market opens, when the hours clock is used.
    #[serde(default)]
    pub market_open_hour: Option<u32>,

    /// UTC hour at which the market closes.
    #[serde(default)]
    pub market_close_hour: Option<u32>,

    /// Per-subscriber event queue capacity.
    #[serde(default = "defaults::event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Webhook delivery attempts (first try included).
    #[serde(default = "defaults::webhook_max_retries")]
    pub webhook_max_retries: u32,

    /// Deadline for the place-order pipeline, in milliseconds.
    #[serde(default = "defaults::rpc_deadline_ms")]
    pub rpc_deadline_ms: u64,
}

mod defaults {
    pub fn port() -> u16 {
        8080
    }
    pub fn database_path() -> String {
        "stocksim.db".to_string()
    }
    pub fn initial_stocks() -> String {
        "AAPL:150.00:Apple Inc,GOOGL:2800.00:Alphabet Inc,MSFT:300.00:Microsoft Corp,\
         AMZN:3400.00:Amazon.com Inc,TSLA:700.00:Tesla Inc"
            .to_string()
    }
    pub fn price_volatility_factor() -> f64 {
        0.001
    }
    pub fn event_queue_capacity() -> usize {
        1024
    }
    pub fn webhook_max_retries() -> u32 {
        3
    }
    pub fn rpc_deadline_ms() -> u64 {
        10_000
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StockSpec {
    pub symbol: String,
    pub price: f64,
    pub name: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Parse `INITIAL_STOCKS`. Malformed entries are skipped with a
    /// warning rather than failing the boot.
    pub fn stock_specs(&self) -> Vec<StockSpec> {
        self.initial_stocks
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                let mut parts = entry.splitn(3, ':');
                let symbol = parts.next()?.trim().to_uppercase();
                let price: f64 = match parts.next()?.trim().parse() {
                    Ok(p) if p >= 0.01 => p,
                    _ => {
                        tracing::warn!("Skipping malformed stock spec entry: {}", entry);
                        return None;
                    }
                };
                let name = parts
                    .next()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| symbol.clone());
                Some(StockSpec {
                    symbol,
                    price,
                    name,
                })
            })
            .collect()
    }

    pub fn market_hours(&self) -> Option<(u32, u32)> {
        match (self.market_open_hour, self.market_close_hour) {
            (Some(open), Some(close)) if open < 24 && close < 24 => Some((open, close)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_stocks(spec: &str) -> AppConfig {
        AppConfig {
            port: 8080,
            database_path: "test.db".to_string(),
            initial_stocks: spec.to_string(),
            price_volatility_factor: 0.001,
            market_open_hour: None,
            market_close_hour: None,
            event_queue_capacity: 1024,
            webhook_max_retries: 3,
            rpc_deadline_ms: 10_000,
        }
    }

    #[test]
    fn parses_stock_specs() {
        let cfg = config_with_stocks("AAPL:150.00:Apple Inc,msft:300:Microsoft");
        let specs = cfg.stock_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].symbol, "AAPL");
        assert_eq!(specs[0].price, 150.0);
        assert_eq!(specs[0].name, "Apple Inc");
        assert_eq!(specs[1].symbol, "MSFT");
    }

    #[test]
    fn name_defaults_to_symbol() {
        let cfg = config_with_stocks("TSLA:700");
        let specs = cfg.stock_specs();
        assert_eq!(specs[0].name, "TSLA");
    }

    #[test]
    fn malformed_entries_skipped() {
        let cfg = config_with_stocks("AAPL:150.00,JUNK,BAD:-5,GOOGL:2800");
        let specs = cfg.stock_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].symbol, "AAPL");
        assert_eq!(specs[1].symbol, "GOOGL");
    }

    #[test]
    fn market_hours_require_both_ends() {
        let mut cfg = config_with_stocks("");
        assert_eq!(cfg.market_hours(), None);
        cfg.market_open_hour = Some(9);
        assert_eq!(cfg.market_hours(), None);
        cfg.market_close_hour = Some(17);
        assert_eq!(cfg.market_hours(), Some((9, 17)));
        cfg.market_close_hour = Some(24);
        assert_eq!(cfg.market_hours(), None);
    }
}
