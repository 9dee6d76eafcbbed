use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::events::{membership_changed, publish_to_all, publish_to_room, publish_to_user};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::presence::{connected_users, get_presence, online_users};

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                // Publishing
                .route("/rooms/{room_id}/events", post(publish_to_room))
                .route("/users/{user_id}/events", post(publish_to_user))
                .route("/events", post(publish_to_all))
                // Membership invalidation
                .route(
                    "/circles/{circle_id}/membership-changed",
                    post(membership_changed),
                )
                // Presence
                .route("/presence/{user_id}", get(get_presence))
                .route("/users/online", get(online_users))
                .route("/users/connected", get(connected_users))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
