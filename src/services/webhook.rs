//! Webhook subscriptions and delivery.
//!
//! Subscriptions live in the `webhooks` table. A delivery worker
//! subscribes to the bus with a wildcard filter and POSTs each matching
//! event to every active subscription, retrying with exponential
//! backoff. Slow endpoints never touch the trading path: delivery runs
//! in its own tasks behind the bus queue.

use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::events::{CustomEvent, Event, EventBus, EventFilter, EventKind};
use crate::metrics::names;
use crate::models::{
    CreateWebhookRequest, PatchWebhookRequest, WebhookRow, WebhookSubscription,
};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_BASE_MS: u64 = 250;

pub struct WebhookService {
    pool: SqlitePool,
    bus: EventBus,
    client: reqwest::Client,
    max_attempts: u32,
}

impl WebhookService {
    pub fn new(pool: SqlitePool, bus: EventBus, max_attempts: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            pool,
            bus,
            client,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Known event kind names, as exposed by `GET /events/types`.
    pub fn event_types() -> Vec<&'static str> {
        EventKind::ALL.iter().map(|k| k.as_str()).collect()
    }

    fn validate_events(events: &[String]) -> Result<(), CoreError> {
        for name in events {
            if name != "*" && EventKind::parse(name).is_none() {
                return Err(CoreError::Validation(format!(
                    "unknown event kind: {}",
                    name
                )));
            }
        }
        Ok(())
    }

    pub async fn create(
        &self,
        req: &CreateWebhookRequest,
    ) -> Result<WebhookSubscription, CoreError> {
        Self::validate_events(&req.events)?;
        let row = WebhookRow {
            id: Uuid::new_v4(),
            url: req.url.clone(),
            events: serde_json::to_string(&req.events)
                .map_err(|e| CoreError::Internal(e.to_string()))?,
            active: true,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO webhooks (id, url, events, active, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(row.id)
        .bind(&row.url)
        .bind(&row.events)
        .bind(row.active)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        tracing::info!("Webhook {} registered for {}", row.id, row.url);
        Ok(row.into())
    }

    pub async fn list(&self) -> Result<Vec<WebhookSubscription>, CoreError> {
        let rows: Vec<WebhookRow> =
            sqlx::query_as("SELECT * FROM webhooks ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<WebhookSubscription, CoreError> {
        let row: Option<WebhookRow> = sqlx::query_as("SELECT * FROM webhooks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Into::into)
            .ok_or_else(|| CoreError::NotFound(format!("webhook {}", id)))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("webhook {}", id)));
        }
        Ok(())
    }

    pub async fn patch(
        &self,
        id: Uuid,
        req: &PatchWebhookRequest,
    ) -> Result<WebhookSubscription, CoreError> {
        let mut current = self.get(id).await?;
        if let Some(url) = &req.url {
            current.url = url.clone();
        }
        if let Some(events) = &req.events {
            Self::validate_events(events)?;
            current.events = events.clone();
        }
        if let Some(active) = req.active {
            current.active = active;
        }

        sqlx::query("UPDATE webhooks SET url = ?1, events = ?2, active = ?3 WHERE id = ?4")
            .bind(&current.url)
            .bind(
                serde_json::to_string(&current.events)
                    .map_err(|e| CoreError::Internal(e.to_string()))?,
            )
            .bind(current.active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(current)
    }

    /// Manual publish surface (`POST /events`). The type must be a
    /// known kind.
    pub fn publish_custom(
        &self,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<(), CoreError> {
        if EventKind::parse(event_type).is_none() {
            return Err(CoreError::Validation(format!(
                "unknown event kind: {}",
                event_type
            )));
        }
        self.bus.publish(Event::Custom(CustomEvent {
            kind: event_type.to_string(),
            data,
            ts: Utc::now().timestamp_millis(),
        }));
        Ok(())
    }

    /// One-shot test delivery; no retries.
    pub async fn test_delivery(&self, url: &str) -> Result<u16, CoreError> {
        let payload = serde_json::json!({
            "event_type": "WEBHOOK_TEST",
            "data": { "message": "test delivery" },
            "timestamp": Utc::now().timestamp_millis(),
        });
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("test delivery failed: {}", e)))?;
        Ok(response.status().as_u16())
    }

    /// Start the delivery worker. If the worker itself is dropped for
    /// falling behind, it re-subscribes and continues with new events.
    pub fn spawn_delivery_worker(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Webhook delivery worker started");
            loop {
                let mut stream = service.bus.subscribe(EventFilter::all());
                while let Some(event) = stream.recv().await {
                    if event.is_overflow() {
                        tracing::warn!(
                            "Webhook delivery worker overflowed; events were skipped"
                        );
                        break;
                    }
                    if let Err(e) = service.dispatch(&event).await {
                        tracing::error!("Webhook dispatch error: {}", e);
                    }
                }
            }
        });
    }

    /// Fan one event out to every active, matching subscription.
    async fn dispatch(&self, event: &Event) -> Result<(), CoreError> {
        let rows: Vec<WebhookRow> = sqlx::query_as("SELECT * FROM webhooks WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let kind = event.kind_str().to_string();
        let payload = Arc::new(serde_json::json!({
            "event_type": kind.as_str(),
            "data": event,
            "timestamp": Utc::now().timestamp_millis(),
        }));

        for subscription in rows.into_iter().map(WebhookSubscription::from) {
            if !subscription_matches(&subscription, &kind) {
                continue;
            }
            let client = self.client.clone();
            let payload = Arc::clone(&payload);
            let max_attempts = self.max_attempts;
            tokio::spawn(async move {
                deliver_with_retry(client, &subscription.url, &payload, max_attempts).await;
            });
        }
        Ok(())
    }
}

fn subscription_matches(subscription: &WebhookSubscription, kind: &str) -> bool {
    subscription
        .events
        .iter()
        .any(|e| e == "*" || e == kind)
}

async fn deliver_with_retry(
    client: reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
    max_attempts: u32,
) {
    for attempt in 1..=max_attempts {
        match client.post(url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {
                metrics::counter!(names::WEBHOOK_DELIVERIES_TOTAL).increment(1);
                return;
            }
            Ok(response) => {
                tracing::warn!(
                    "Webhook delivery to {} got status {} (attempt {}/{})",
                    url,
                    response.status(),
                    attempt,
                    max_attempts
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Webhook delivery to {} failed: {} (attempt {}/{})",
                    url,
                    e,
                    attempt,
                    max_attempts
                );
            }
        }
        if attempt < max_attempts {
            let jitter = rand::thread_rng().gen_range(0..50);
            let backoff = BACKOFF_BASE_MS * 2u64.pow(attempt - 1) + jitter;
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }
    metrics::counter!(names::WEBHOOK_FAILURES_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> WebhookService {
        let db = crate::db::Database::connect("sqlite::memory:").await.unwrap();
        WebhookService::new(db.pool, EventBus::new(64), 3)
    }

    fn create_request(events: Vec<&str>) -> CreateWebhookRequest {
        CreateWebhookRequest {
            url: "http://localhost:9000/hook".to_string(),
            events: events.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let service = service().await;
        let created = service
            .create(&create_request(vec!["ORDER_EXECUTED", "PRICE_UPDATE"]))
            .await
            .unwrap();
        assert!(created.active);

        let fetched = service.get(created.id).await.unwrap();
        assert_eq!(fetched.events, vec!["ORDER_EXECUTED", "PRICE_UPDATE"]);

        let patched = service
            .patch(
                created.id,
                &PatchWebhookRequest {
                    url: None,
                    events: Some(vec!["*".to_string()]),
                    active: Some(false),
                },
            )
            .await
            .unwrap();
        assert!(!patched.active);
        assert_eq!(patched.events, vec!["*"]);

        assert_eq!(service.list().await.unwrap().len(), 1);
        service.delete(created.id).await.unwrap();
        assert!(service.list().await.unwrap().is_empty());
        assert_eq!(service.get(created.id).await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn unknown_event_kind_rejected() {
        let service = service().await;
        let err = service
            .create(&create_request(vec!["ORDER_TELEPORTED"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let err = service
            .publish_custom("ORDER_TELEPORTED", serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn wildcard_and_exact_matching() {
        let service = service().await;
        let wildcard = service.create(&create_request(vec!["*"])).await.unwrap();
        let exact = service
            .create(&create_request(vec!["PRICE_UPDATE"]))
            .await
            .unwrap();

        assert!(subscription_matches(&wildcard, "ORDER_PLACED"));
        assert!(subscription_matches(&exact, "PRICE_UPDATE"));
        assert!(!subscription_matches(&exact, "ORDER_PLACED"));
    }

    #[test]
    fn event_types_cover_the_taxonomy() {
        let types = WebhookService::event_types();
        assert_eq!(types.len(), 9);
        assert!(types.contains(&"ORDER_PLACED"));
        assert!(types.contains(&"PREDICTION_AVAILABLE"));
    }
}
