use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use super::channels::Channel;
use super::handler::handle_socket;
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    /// Comma-separated symbols; empty means all.
    pub symbols: Option<String>,
}

impl StreamQuery {
    fn symbols(&self) -> Vec<String> {
        match &self.symbols {
            None => vec!["*".to_string()],
            Some(raw) => {
                let parsed: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                if parsed.is_empty() {
                    vec!["*".to_string()]
                } else {
                    parsed
                }
            }
        }
    }
}

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/stream", get(ws_stream))
        .route("/market", get(ws_market))
        .route("/prices", get(ws_prices))
}

/// Generic endpoint; clients subscribe via messages.
async fn ws_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Vec::new()))
}

/// StreamMarketEvents(symbols[]): pre-subscribed to market channels.
async fn ws_market(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let channels = query.symbols().into_iter().map(Channel::Market).collect();
    ws.on_upgrade(move |socket| handle_socket(socket, state, channels))
}

/// StreamPrices(symbols[]): pre-subscribed to price channels.
async fn ws_prices(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let channels = query.symbols().into_iter().map(Channel::Prices).collect();
    ws.on_upgrade(move |socket| handle_socket(socket, state, channels))
}
