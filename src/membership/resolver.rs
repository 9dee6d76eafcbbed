use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::redis::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("membership store error: {0}")]
    Store(#[from] PoolError),
    #[error("membership service unavailable: {0}")]
    Unavailable(String),
}

/// Narrow view of the circle service
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    /// Circles (rooms) the user belongs to
    async fn circles_for_user(&self, user_id: &str) -> Result<Vec<String>, MembershipError>;

    /// Users belonging to a circle
    async fn members_of_circle(&self, circle_id: &str) -> Result<Vec<String>, MembershipError>;
}

/// In-memory membership, for development and tests
#[derive(Default)]
pub struct StaticMembershipResolver {
    /// user_id -> circle ids
    circles: DashMap<String, HashSet<String>>,
}

impl StaticMembershipResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, circle_id: &str, user_id: &str) {
        self.circles
            .entry(user_id.to_string())
            .or_default()
            .insert(circle_id.to_string());
    }

    pub fn remove_member(&self, circle_id: &str, user_id: &str) -> bool {
        self.circles
            .get_mut(user_id)
            .map(|mut set| set.remove(circle_id))
            .unwrap_or(false)
    }

    pub fn set_circles(&self, user_id: &str, circles: &[&str]) {
        self.circles.insert(
            user_id.to_string(),
            circles.iter().map(|c| c.to_string()).collect(),
        );
    }
}

#[async_trait]
impl MembershipResolver for StaticMembershipResolver {
    async fn circles_for_user(&self, user_id: &str) -> Result<Vec<String>, MembershipError> {
        let mut circles: Vec<String> = self
            .circles
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        circles.sort();
        Ok(circles)
    }

    async fn members_of_circle(&self, circle_id: &str) -> Result<Vec<String>, MembershipError> {
        let mut members: Vec<String> = self
            .circles
            .iter()
            .filter(|entry| entry.value().contains(circle_id))
            .map(|entry| entry.key().clone())
            .collect();
        members.sort();
        Ok(members)
    }
}
