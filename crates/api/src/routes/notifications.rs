//! Notification submission and status routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::NotificationRequest;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", post(create_notification))
        .route("/notifications/{id}", get(get_notification_status))
}

/// POST /notifications — Queue a notification for delivery.
async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let Json(request) = payload.map_err(|rejection| AppError::Decode(rejection.body_text()))?;

    let notification = state.publisher.publish(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "data": {
                "notification_id": notification.notification_id,
                "status": "queued",
                "type": notification.channel,
            },
            "message": "Notification queued successfully"
        })),
    ))
}

/// GET /notifications/{id} — Last recorded delivery status.
async fn get_notification_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::Validation(format!("Invalid notification id: {id}")))?;

    let record = state
        .status
        .get(id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("Notification {id} not found")))?;

    Ok(Json(json!({
        "success": true,
        "data": record,
        "message": "Status retrieved"
    })))
}
