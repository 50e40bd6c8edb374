//! Webhook HTTP surface.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CreateWebhookRequest, PatchWebhookRequest, PublishEventRequest, TestWebhookRequest,
    WebhookSubscription,
};
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

/// POST /webhooks
pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<Json<ApiResponse<WebhookSubscription>>, AppError> {
    req.validate()?;
    let subscription = state.webhooks.create(&req).await?;
    Ok(Json(ApiResponse::success(subscription)))
}

/// GET /webhooks
pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<WebhookSubscription>>>, AppError> {
    Ok(Json(ApiResponse::success(state.webhooks.list().await?)))
}

/// GET /webhooks/:id
pub async fn get_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WebhookSubscription>>, AppError> {
    Ok(Json(ApiResponse::success(state.webhooks.get(id).await?)))
}

/// DELETE /webhooks/:id
pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    state.webhooks.delete(id).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "deleted": true,
    }))))
}

/// PATCH /webhooks/:id
pub async fn patch_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PatchWebhookRequest>,
) -> Result<Json<ApiResponse<WebhookSubscription>>, AppError> {
    req.validate()?;
    Ok(Json(ApiResponse::success(
        state.webhooks.patch(id, &req).await?,
    )))
}

/// POST /webhooks/test
pub async fn test_webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestWebhookRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    req.validate()?;
    let status = state.webhooks.test_delivery(&req.url).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "delivered": (200..300).contains(&status),
        "status": status,
    }))))
}

/// POST /events
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishEventRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    state
        .webhooks
        .publish_custom(&req.event_type, req.event_data)?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "published": true,
    }))))
}

/// GET /events/types
pub async fn event_types(
    State(_state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<&'static str>>> {
    Json(ApiResponse::success(
        crate::services::webhook::WebhookService::event_types(),
    ))
}
