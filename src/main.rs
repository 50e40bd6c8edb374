use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stocksim_backend::config::AppConfig;
use stocksim_backend::db::Database;
use stocksim_backend::events::EventBus;
use stocksim_backend::metrics::init_metrics;
use stocksim_backend::services::analytics::AnalyticsRecorder;
use stocksim_backend::services::market::MarketService;
use stocksim_backend::services::matching::MatchingEngine;
use stocksim_backend::services::portfolio::PortfolioStore;
use stocksim_backend::services::price::PriceEngine;
use stocksim_backend::services::settlement::SettlementCoordinator;
use stocksim_backend::services::webhook::WebhookService;
use stocksim_backend::{api, websocket, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stocksim_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting StockSim Trading Core v{}", env!("CARGO_PKG_VERSION"));

    // Install the Prometheus recorder before any counter is touched
    let metrics_handle = init_metrics();

    // Initialize database
    let database_url = if config.database_path.starts_with("sqlite:") {
        config.database_path.clone()
    } else {
        format!("sqlite://{}", config.database_path)
    };
    let db = Database::connect(&database_url).await?;
    tracing::info!("Database connected at {}", config.database_path);

    // Event bus with bounded per-subscriber queues
    let bus = EventBus::new(config.event_queue_capacity);
    tracing::info!(
        "Event bus initialized (queue capacity {})",
        config.event_queue_capacity
    );

    // Price engine, seeded from the store plus configured stocks
    let price = Arc::new(PriceEngine::new(
        db.pool.clone(),
        bus.clone(),
        config.price_volatility_factor,
    ));
    let specs = config.stock_specs();
    let created = price.seed(&specs).await?;
    tracing::info!(
        "Price engine initialized ({} configured stocks, {} newly created)",
        specs.len(),
        created
    );

    // Portfolio store and analytics recorder
    let portfolio = Arc::new(PortfolioStore::new(db.pool.clone(), bus.clone()));
    let analytics = Arc::new(AnalyticsRecorder::new(db.pool.clone(), bus.clone()));
    tracing::info!("Portfolio store and analytics recorder initialized");

    // Matching engine + settlement coordinator behind the market service
    let engine = Arc::new(MatchingEngine::new(db.pool.clone(), bus.clone()));
    let settlement = Arc::new(SettlementCoordinator::new(
        db.pool.clone(),
        price.clone(),
        bus.clone(),
    ));
    let market = Arc::new(MarketService::new(
        engine.clone(),
        settlement,
        portfolio.clone(),
        price.clone(),
        db.pool.clone(),
        Duration::from_millis(config.rpc_deadline_ms),
    ));

    // Recover open orders from the store
    match engine.recover().await {
        Ok(0) => tracing::info!("No open orders to recover"),
        Ok(count) => tracing::info!("Recovered {} open orders into the books", count),
        Err(e) => {
            tracing::error!("Failed to recover orders from database: {}", e);
            tracing::warn!("Starting with empty order books");
        }
    }

    // Market hours clock, when configured
    if let Some((open_hour, close_hour)) = config.market_hours() {
        market.spawn_hours_clock(open_hour, close_hour);
    }

    // Webhook delivery worker
    let webhooks = Arc::new(WebhookService::new(
        db.pool.clone(),
        bus.clone(),
        config.webhook_max_retries,
    ));
    webhooks.spawn_delivery_worker();
    tracing::info!("Webhook delivery worker spawned");

    // Periodic top-traded publisher
    {
        let analytics = analytics.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            tracing::info!("Top-traded publisher started");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                match analytics.top_traded(5, chrono::Duration::hours(24)).await {
                    Ok(entries) if !entries.is_empty() => {
                        bus.publish(stocksim_backend::events::Event::Custom(
                            stocksim_backend::events::CustomEvent {
                                kind: "TOP_STOCKS_UPDATED".to_string(),
                                data: serde_json::to_value(&entries).unwrap_or_default(),
                                ts: chrono::Utc::now().timestamp_millis(),
                            },
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Top-traded refresh failed: {}", e),
                }
            }
        });
    }

    // Build application state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        bus,
        market,
        price,
        portfolio,
        analytics,
        webhooks,
        metrics_handle: Some(metrics_handle),
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
