//! Event publishing endpoints used by the backend services.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::dispatch::{DeliveryReport, Envelope, EventType};
use crate::error::{AppError, Result};
use crate::hub::MembershipUpdate;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl PublishRequest {
    fn validate(&self) -> Result<()> {
        if !self.payload.is_object() {
            return Err(AppError::Validation("payload must be a JSON object".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MembershipChangedRequest {
    #[serde(default)]
    pub user_ids: Option<Vec<String>>,
}

/// POST /api/v1/rooms/{room_id}/events
#[tracing::instrument(name = "api.publish_room", skip(state, request), fields(event_type = ?request.event_type))]
pub async fn publish_to_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<DeliveryReport>> {
    request.validate()?;
    let envelope = Envelope::to_room(request.event_type, room_id, request.payload);
    Ok(Json(state.hub.dispatch(&envelope)))
}

/// POST /api/v1/users/{user_id}/events
#[tracing::instrument(name = "api.publish_user", skip(state, request), fields(event_type = ?request.event_type))]
pub async fn publish_to_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<DeliveryReport>> {
    request.validate()?;
    let envelope = Envelope::to_user(request.event_type, user_id, request.payload);
    Ok(Json(state.hub.dispatch(&envelope)))
}

/// POST /api/v1/events
#[tracing::instrument(name = "api.publish_all", skip(state, request), fields(event_type = ?request.event_type))]
pub async fn publish_to_all(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<DeliveryReport>> {
    request.validate()?;
    Ok(Json(state.hub.broadcast_all(request.event_type, request.payload)))
}

/// POST /api/v1/circles/{circle_id}/membership-changed
pub async fn membership_changed(
    State(state): State<AppState>,
    Path(circle_id): Path<String>,
    body: Bytes,
) -> Result<Json<MembershipUpdate>> {
    // empty body: re-resolve everyone related to the circle
    let request: MembershipChangedRequest = if body.is_empty() {
        MembershipChangedRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::Validation(e.to_string()))?
    };
    Ok(Json(
        state.hub.membership_changed(&circle_id, request.user_ids).await,
    ))
}
