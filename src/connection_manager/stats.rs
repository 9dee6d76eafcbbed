//! Connection statistics and info structures

use serde::Serialize;

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
}

/// Per-connection snapshot for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: uuid::Uuid,
    pub user_id: String,
    pub device_id: Option<String>,
    pub rooms: Vec<String>,
    pub queued: usize,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl From<&super::ConnectionHandle> for ConnectionInfo {
    fn from(handle: &super::ConnectionHandle) -> Self {
        let mut rooms = handle.rooms();
        rooms.sort();
        Self {
            connection_id: handle.id,
            user_id: handle.user_id.clone(),
            device_id: handle.device_id.clone(),
            rooms,
            queued: handle.queue_len(),
            connected_at: handle.connected_at,
        }
    }
}
