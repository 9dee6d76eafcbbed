use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::stats::RegistryStats;
use super::types::{ConnectionError, ConnectionHandle, ConnectionLimits};

/// Outcome of a register call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Newly added; `device_count` includes this connection
    Added { device_count: usize },
    /// Connection ID was already registered, nothing changed
    AlreadyRegistered { device_count: usize },
}

/// Live connections keyed by user (multi-device).
///
/// Mutations for one user are serialized by that user's shard lock in
/// `users`; different users proceed independently.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// user_id -> connection_id -> ConnectionHandle
    users: DashMap<String, HashMap<Uuid, Arc<ConnectionHandle>>>,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<Registration, ConnectionError> {
        self.register_with(handle, |_| {})
    }

    /// Register a connection under its user.
    ///
    /// `on_added` runs with the new device count while the user's entry is
    /// still locked, so presence bookkeeping observes transitions in order.
    pub fn register_with<F>(
        &self,
        handle: Arc<ConnectionHandle>,
        on_added: F,
    ) -> Result<Registration, ConnectionError>
    where
        F: FnOnce(usize),
    {
        let mut user_conns = self.users.entry(handle.user_id.clone()).or_default();

        if user_conns.contains_key(&handle.id) {
            return Ok(Registration::AlreadyRegistered {
                device_count: user_conns.len(),
            });
        }

        let total = self.connections.len();
        if total >= self.limits.max_connections {
            let empty = user_conns.is_empty();
            drop(user_conns);
            if empty {
                self.users.remove_if(&handle.user_id, |_, conns| conns.is_empty());
            }
            return Err(ConnectionError::TotalLimitExceeded {
                current: total,
                max: self.limits.max_connections,
            });
        }

        if user_conns.len() >= self.limits.max_connections_per_user {
            return Err(ConnectionError::UserLimitExceeded {
                user_id: handle.user_id.clone(),
                current: user_conns.len(),
                max: self.limits.max_connections_per_user,
            });
        }

        user_conns.insert(handle.id, handle.clone());
        self.connections.insert(handle.id, handle.clone());
        let device_count = user_conns.len();
        on_added(device_count);

        tracing::info!(
            connection_id = %handle.id,
            user_id = %handle.user_id,
            device_count = device_count,
            "Connection registered"
        );

        Ok(Registration::Added { device_count })
    }

    pub fn unregister(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.unregister_with(connection_id, |_, _| {})
    }

    /// Remove a connection. `on_removed` receives the remaining device count
    /// (zero means the user just went offline) under the user's lock.
    pub fn unregister_with<F>(&self, connection_id: Uuid, on_removed: F) -> Option<Arc<ConnectionHandle>>
    where
        F: FnOnce(&Arc<ConnectionHandle>, usize),
    {
        let user_id = self.connections.get(&connection_id)?.user_id.clone();

        let handle = match self.users.entry(user_id) {
            Entry::Occupied(mut user_conns) => {
                let handle = user_conns.get_mut().remove(&connection_id)?;
                self.connections.remove(&connection_id);
                let remaining = user_conns.get().len();
                on_removed(&handle, remaining);
                if remaining == 0 {
                    user_conns.remove();
                }
                handle
            }
            Entry::Vacant(_) => return None,
        };

        tracing::info!(
            connection_id = %connection_id,
            user_id = %handle.user_id,
            "Connection unregistered"
        );

        Some(handle)
    }

    /// Snapshot of a user's connections
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.users
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn device_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|conns| conns.len()).unwrap_or(0)
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn connected_users(&self) -> Vec<String> {
        self.users.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections idle for longer than `timeout_secs`
    pub fn find_stale_connections(&self, timeout_secs: u64) -> Vec<Uuid> {
        let now = chrono::Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.connections
            .iter()
            .filter(|entry| now.signed_duration_since(entry.value().last_activity()) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_connections: self.connections.len(),
            unique_users: self.users.len(),
            max_connections: self.limits.max_connections,
            max_connections_per_user: self.limits.max_connections_per_user,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle(user_id: &str) -> Arc<ConnectionHandle> {
        Arc::new(ConnectionHandle::new(user_id, None, 8))
    }

    #[test]
    fn test_register_multi_device() {
        let registry = ConnectionRegistry::new();
        let x = handle("alice");
        let y = handle("alice");

        assert_eq!(
            registry.register(x.clone()).unwrap(),
            Registration::Added { device_count: 1 }
        );
        assert_eq!(
            registry.register(y.clone()).unwrap(),
            Registration::Added { device_count: 2 }
        );
        assert_eq!(registry.connections_for_user("alice").len(), 2);
        assert_eq!(registry.connected_users(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let x = handle("alice");
        let calls = AtomicUsize::new(0);

        registry
            .register_with(x.clone(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let second = registry
            .register_with(x.clone(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(second, Registration::AlreadyRegistered { device_count: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_reports_remaining() {
        let registry = ConnectionRegistry::new();
        let x = handle("alice");
        let y = handle("alice");
        registry.register(x.clone()).unwrap();
        registry.register(y.clone()).unwrap();

        let mut remaining = None;
        registry.unregister_with(x.id, |_, n| remaining = Some(n));
        assert_eq!(remaining, Some(1));

        registry.unregister_with(y.id, |_, n| remaining = Some(n));
        assert_eq!(remaining, Some(0));
        assert!(registry.connected_users().is_empty());
        assert!(registry.is_empty());

        // second unregister is a no-op
        assert!(registry.unregister(y.id).is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = ConnectionRegistry::new();
        let x = handle("alice");
        registry.register(x.clone()).unwrap();

        let snapshot = registry.connections_for_user("alice");
        registry.unregister(x.id);

        assert_eq!(snapshot.len(), 1);
        assert!(registry.connections_for_user("alice").is_empty());
    }

    #[test]
    fn test_per_user_limit() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 100,
            max_connections_per_user: 2,
        });

        registry.register(handle("bob")).unwrap();
        registry.register(handle("bob")).unwrap();
        let err = registry.register(handle("bob")).unwrap_err();
        assert!(matches!(err, ConnectionError::UserLimitExceeded { max: 2, .. }));

        // other users unaffected
        assert!(registry.register(handle("carol")).is_ok());
    }

    #[test]
    fn test_total_limit_leaves_no_empty_user_entry() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 1,
            max_connections_per_user: 5,
        });

        registry.register(handle("bob")).unwrap();
        let err = registry.register(handle("dave")).unwrap_err();
        assert!(matches!(err, ConnectionError::TotalLimitExceeded { .. }));
        assert_eq!(registry.stats().unique_users, 1);
    }

    #[test]
    fn test_find_stale_connections() {
        let registry = ConnectionRegistry::new();
        let fresh = handle("alice");
        let stale = handle("bob");
        stale.set_last_activity(chrono::Utc::now() - chrono::Duration::seconds(600));

        registry.register(fresh.clone()).unwrap();
        registry.register(stale.clone()).unwrap();

        assert_eq!(registry.find_stale_connections(120), vec![stale.id]);
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister_same_user() {
        let registry = Arc::new(ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 10_000,
            max_connections_per_user: 10_000,
        }));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let h = handle("alice");
                registry.register(h.clone()).unwrap();
                tokio::task::yield_now().await;
                registry.unregister(h.id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.device_count("alice"), 0);
        assert!(registry.connected_users().is_empty());
    }
}
