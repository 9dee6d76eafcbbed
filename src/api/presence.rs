//! Presence and connected-user queries.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection_manager::ConnectionInfo;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: String,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub device_count: usize,
    /// Live connections on this instance
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Serialize)]
pub struct UserListResponse {
    pub users: Vec<String>,
    pub count: usize,
}

impl From<Vec<String>> for UserListResponse {
    fn from(users: Vec<String>) -> Self {
        Self {
            count: users.len(),
            users,
        }
    }
}

/// GET /api/v1/presence/{user_id}
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let entry = state.hub.presence_of(&user_id);
    let connections = state
        .hub
        .registry()
        .connections_for_user(&user_id)
        .iter()
        .map(|handle| ConnectionInfo::from(handle.as_ref()))
        .collect();
    Json(PresenceResponse {
        is_online: entry.as_ref().is_some_and(|e| e.is_online),
        last_seen: entry.as_ref().map(|e| e.last_seen),
        device_count: entry.map(|e| e.device_count).unwrap_or(0),
        connections,
        user_id,
    })
}

/// GET /api/v1/users/online
pub async fn online_users(State(state): State<AppState>) -> Json<UserListResponse> {
    Json(state.hub.online_users().into())
}

/// GET /api/v1/users/connected
pub async fn connected_users(State(state): State<AppState>) -> Json<UserListResponse> {
    Json(state.hub.get_connected_users().into())
}
