//! API layer - HTTP endpoint handlers organized by concern.

mod events;
mod health;
mod metrics;
mod presence;
mod routes;

pub use events::{
    membership_changed, publish_to_all, publish_to_room, publish_to_user,
    MembershipChangedRequest, PublishRequest,
};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use presence::{connected_users, get_presence, online_users, PresenceResponse, UserListResponse};
pub use routes::api_routes;
