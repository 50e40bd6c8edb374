use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::order::datetime_as_millis;

/// A webhook subscription row. `events` is stored as a JSON array of
/// event kind names; `"*"` subscribes to everything.
#[derive(Debug, Clone, FromRow)]
pub struct WebhookRow {
    pub id: Uuid,
    pub url: String,
    pub events: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub created_at: DateTime<Utc>,
}

impl From<WebhookRow> for WebhookSubscription {
    fn from(row: WebhookRow) -> Self {
        let events = serde_json::from_str(&row.events).unwrap_or_default();
        Self {
            id: row.id,
            url: row.url,
            events,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateWebhookRequest {
    #[validate(url)]
    pub url: String,
    #[validate(length(min = 1))]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PatchWebhookRequest {
    #[validate(url)]
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TestWebhookRequest {
    #[validate(url)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishEventRequest {
    pub event_type: String,
    pub event_data: serde_json::Value,
}
