//! The real-time hub: an explicitly constructed instance tying together the
//! registry, room index, presence tracker and dispatcher.
//!
//! Connection lifecycle:
//! 1. `authenticate` validates the token (bounded by the setup timeout)
//! 2. `admit` resolves circles, registers the connection and subscribes it
//!    to its rooms. A timed-out or cancelled setup leaves no state behind.
//! 3. `disconnect` unregisters, unsubscribes and closes the outbound queue.
//!
//! `start` spawns the presence pump and the liveness monitor; `stop` closes
//! every connection and joins them.

mod error;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AuthValidator, Claims};
use crate::config::{DispatchConfig, Settings};
use crate::connection_manager::{
    ConnectionHandle, ConnectionLimits, ConnectionRegistry, RegistryStats,
};
use crate::dispatch::{
    DeliveryReport, Dispatcher, DispatcherStatsSnapshot, Envelope, EventType, LivenessProbe,
};
use crate::membership::MembershipResolver;
use crate::metrics::{ConnectionMetrics, WsMessageMetrics};
use crate::presence::{PresenceChange, PresenceEntry, PresenceTracker};
use crate::rooms::{RoomIndex, RoomStats};
use crate::websocket::{ClientMessage, ControlMessage};

pub use error::HubError;

/// Close reasons used by the hub itself
pub mod reasons {
    pub const CLIENT_CLOSED: &str = "client_closed";
    pub const UNRESPONSIVE: &str = "unresponsive";
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub outbound_queue_capacity: usize,
    /// Bound on token validation and on membership resolution
    pub setup_timeout: Duration,
    pub offline_debounce: Duration,
    pub limits: ConnectionLimits,
    pub dispatch: DispatchConfig,
}

impl HubConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            outbound_queue_capacity: settings.websocket.outbound_queue_capacity,
            setup_timeout: Duration::from_millis(settings.websocket.setup_timeout_ms),
            offline_debounce: Duration::from_millis(settings.presence.offline_debounce_ms),
            limits: ConnectionLimits {
                max_connections: settings.websocket.max_connections,
                max_connections_per_user: settings.websocket.max_connections_per_user,
            },
            dispatch: settings.dispatch.clone(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 64,
            setup_timeout: Duration::from_secs(3),
            offline_debounce: Duration::from_secs(7),
            limits: ConnectionLimits::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Result of applying a membership change
#[derive(Debug, Clone, Default, Serialize)]
pub struct MembershipUpdate {
    /// Connected users whose circles were re-resolved
    pub users: usize,
    pub subscribed: usize,
    pub unsubscribed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: RegistryStats,
    pub rooms: RoomStats,
    pub dispatch: DispatcherStatsSnapshot,
    pub online_users: usize,
}

pub struct Hub {
    config: HubConfig,
    auth: Arc<dyn AuthValidator>,
    membership: Arc<dyn MembershipResolver>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<Dispatcher>,
    presence_rx: Mutex<Option<mpsc::UnboundedReceiver<PresenceChange>>>,
    probe_rx: Mutex<Option<mpsc::UnboundedReceiver<LivenessProbe>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        auth: Arc<dyn AuthValidator>,
        membership: Arc<dyn MembershipResolver>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_limits(config.limits));
        let rooms = Arc::new(RoomIndex::new());
        let (presence, presence_rx) = PresenceTracker::new(config.offline_debounce);
        let (dispatcher, probe_rx) =
            Dispatcher::new(registry.clone(), rooms.clone(), config.dispatch.clone());

        Self {
            config,
            auth,
            membership,
            registry,
            rooms,
            presence: Arc::new(presence),
            dispatcher: Arc::new(dispatcher),
            presence_rx: Mutex::new(Some(presence_rx)),
            probe_rx: Mutex::new(Some(probe_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the presence pump and the liveness monitor. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        if let Some(rx) = self.presence_rx.lock().take() {
            tasks.push(tokio::spawn(self.clone().presence_pump(rx)));
        }
        if let Some(rx) = self.probe_rx.lock().take() {
            tasks.push(tokio::spawn(self.clone().liveness_monitor(rx)));
        }

        tracing::info!(
            setup_timeout_ms = self.config.setup_timeout.as_millis() as u64,
            offline_debounce_ms = self.config.offline_debounce.as_millis() as u64,
            "Hub started"
        );
    }

    /// Close every connection (each writer reports `server_shutdown`) and
    /// wait for background tasks.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let connections = self.registry.all_connections();
        let closed = connections
            .iter()
            .filter(|handle| self.disconnect(handle.id, reasons::SERVER_SHUTDOWN))
            .count();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        tracing::info!(closed = closed, "Hub stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Validate a token within the setup timeout
    pub async fn authenticate(&self, token: &str) -> Result<Claims, HubError> {
        let result = match tokio::time::timeout(
            self.config.setup_timeout,
            self.auth.validate_token(token),
        )
        .await
        {
            Ok(Ok(claims)) => Ok(claims),
            Ok(Err(e)) => Err(HubError::Unauthorized(e)),
            Err(_) => Err(HubError::SetupTimeout),
        };

        if let Err(ref e) = result {
            self.record_rejection(None, e);
        }
        result
    }

    /// Register an authenticated connection.
    ///
    /// Membership is resolved first; only when that succeeds (and `cancel`
    /// has not fired) does any shared state change.
    #[tracing::instrument(
        name = "hub.admit",
        skip(self, claims, device_id, cancel),
        fields(user_id = %claims.sub)
    )]
    pub async fn admit(
        &self,
        claims: &Claims,
        device_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionHandle>, HubError> {
        let result = self.admit_inner(claims, device_id, cancel).await;
        if let Err(ref e) = result {
            self.record_rejection(Some(claims.user_id()), e);
        }
        result
    }

    async fn admit_inner(
        &self,
        claims: &Claims,
        device_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionHandle>, HubError> {
        if !self.is_running() {
            return Err(HubError::ShuttingDown);
        }

        let user_id = claims.user_id();
        let circles = self.resolve_circles(user_id, cancel).await?;
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        let device_id = device_id.or_else(|| claims.device_id.clone());
        let handle = Arc::new(ConnectionHandle::new(
            user_id,
            device_id,
            self.config.outbound_queue_capacity,
        ));

        let presence = &self.presence;
        let rooms = &self.rooms;
        self.registry.register_with(handle.clone(), |device_count| {
            rooms.cache_circles(user_id, circles.clone());
            presence.connection_opened(user_id, device_count, &circles);
        })?;
        ConnectionMetrics::record_opened();

        // stop() may have taken its snapshot while membership was resolving
        if !self.is_running() {
            self.disconnect(handle.id, reasons::SERVER_SHUTDOWN);
            return Err(HubError::ShuttingDown);
        }

        for circle_id in &circles {
            self.rooms.subscribe(&handle, circle_id);
        }

        handle.send_control(ControlMessage::Connected {
            connection_id: handle.id,
            rooms: circles,
        });

        Ok(handle)
    }

    /// `authenticate` followed by `admit`
    pub async fn connect(
        &self,
        token: &str,
        device_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionHandle>, HubError> {
        let claims = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let err = HubError::Cancelled;
                self.record_rejection(None, &err);
                return Err(err);
            }
            claims = self.authenticate(token) => claims?,
        };
        self.admit(&claims, device_id, cancel).await
    }

    async fn resolve_circles(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, HubError> {
        let lookup = tokio::time::timeout(
            self.config.setup_timeout,
            self.membership.circles_for_user(user_id),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            _ = self.shutdown.cancelled() => Err(HubError::ShuttingDown),
            result = lookup => match result {
                Ok(Ok(circles)) => Ok(circles),
                Ok(Err(e)) => Err(HubError::MembershipUnavailable(e)),
                Err(_) => Err(HubError::SetupTimeout),
            },
        }
    }

    fn record_rejection(&self, user_id: Option<&str>, error: &HubError) {
        ConnectionMetrics::record_setup_rejected(error.code());
        tracing::warn!(
            user_id = user_id.unwrap_or("-"),
            code = error.code(),
            error = %error,
            "Connection setup rejected"
        );
    }

    /// Remove a connection everywhere and close its queue. Idempotent;
    /// returns false if the connection was already gone.
    pub fn disconnect(&self, connection_id: Uuid, reason: &str) -> bool {
        let presence = &self.presence;
        let rooms = &self.rooms;
        let Some(handle) = self
            .registry
            .unregister_with(connection_id, |handle, remaining| {
                if remaining == 0 {
                    rooms.invalidate_user(&handle.user_id);
                }
                presence.connection_closed(&handle.user_id, remaining, &handle.rooms());
            })
        else {
            return false;
        };

        self.rooms.unsubscribe_all(&handle);
        let discarded = handle.close_with_reason(reason);

        let lifetime = chrono::Utc::now() - handle.connected_at;
        ConnectionMetrics::record_closed(lifetime.num_milliseconds().max(0) as f64 / 1000.0);

        tracing::info!(
            connection_id = %connection_id,
            user_id = %handle.user_id,
            reason = reason,
            discarded = discarded,
            "Connection closed"
        );
        true
    }

    /// Hub-initiated disconnect (liveness failure, idle timeout)
    pub fn force_disconnect(&self, connection_id: Uuid, reason: &str) -> bool {
        let closed = self.disconnect(connection_id, reason);
        if closed {
            ConnectionMetrics::record_forced_disconnect(reason);
            tracing::warn!(connection_id = %connection_id, reason = reason, "Connection force-closed");
        }
        closed
    }

    pub fn dispatch(&self, envelope: &Envelope) -> DeliveryReport {
        self.dispatcher.dispatch(envelope)
    }

    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> DeliveryReport {
        self.dispatcher
            .dispatch(&Envelope::to_room(event_type, room_id, payload))
    }

    pub fn broadcast_to_user(
        &self,
        user_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> DeliveryReport {
        self.dispatcher
            .dispatch(&Envelope::to_user(event_type, user_id, payload))
    }

    pub fn broadcast_all(&self, event_type: EventType, payload: serde_json::Value) -> DeliveryReport {
        self.dispatcher.broadcast_all(event_type, payload)
    }

    /// Users with at least one registered connection, sorted
    pub fn get_connected_users(&self) -> Vec<String> {
        let mut users = self.registry.connected_users();
        users.sort();
        users
    }

    /// Pure in-memory read
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.presence.is_user_online(user_id)
    }

    pub fn presence_of(&self, user_id: &str) -> Option<PresenceEntry> {
        self.presence.get(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users = self.presence.online_users();
        users.sort();
        users
    }

    /// Re-resolve the circles of users affected by a change to `circle_id`
    /// and reconcile their live subscriptions. Without `user_ids`, affected
    /// users are the circle's current subscribers plus its members as
    /// reported by the membership service.
    #[tracing::instrument(name = "hub.membership_changed", skip(self, user_ids))]
    pub async fn membership_changed(
        &self,
        circle_id: &str,
        user_ids: Option<Vec<String>>,
    ) -> MembershipUpdate {
        let mut affected: HashSet<String> = HashSet::new();

        match user_ids {
            Some(ids) => {
                for user_id in &ids {
                    self.rooms.invalidate_user(user_id);
                }
                affected.extend(ids);
            }
            None => {
                affected.extend(self.rooms.invalidate_circle(circle_id));
                affected.extend(
                    self.rooms
                        .members_of(circle_id)
                        .iter()
                        .map(|handle| handle.user_id.clone()),
                );
                match tokio::time::timeout(
                    self.config.setup_timeout,
                    self.membership.members_of_circle(circle_id),
                )
                .await
                {
                    Ok(Ok(members)) => affected.extend(members),
                    Ok(Err(e)) => {
                        tracing::warn!(circle_id = %circle_id, error = %e, "Failed to list circle members")
                    }
                    Err(_) => tracing::warn!(circle_id = %circle_id, "Listing circle members timed out"),
                }
            }
        }

        let mut update = MembershipUpdate::default();
        for user_id in affected {
            let connections = self.registry.connections_for_user(&user_id);
            if connections.is_empty() {
                continue;
            }

            let circles = match tokio::time::timeout(
                self.config.setup_timeout,
                self.membership.circles_for_user(&user_id),
            )
            .await
            {
                Ok(Ok(circles)) => circles,
                Ok(Err(e)) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to re-resolve circles");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(user_id = %user_id, "Re-resolving circles timed out");
                    continue;
                }
            };

            for handle in &connections {
                let (subscribed, unsubscribed) = self.reconcile_rooms(handle, &circles);
                update.subscribed += subscribed;
                update.unsubscribed += unsubscribed;
            }
            self.rooms.cache_circles(&user_id, circles);
            if self.registry.device_count(&user_id) == 0 {
                self.rooms.invalidate_user(&user_id);
            }
            update.users += 1;
        }

        tracing::info!(
            users = update.users,
            subscribed = update.subscribed,
            unsubscribed = update.unsubscribed,
            "Membership change reconciled"
        );
        update
    }

    fn reconcile_rooms(&self, handle: &Arc<ConnectionHandle>, circles: &[String]) -> (usize, usize) {
        let desired: HashSet<&str> = circles.iter().map(String::as_str).collect();
        let mut unsubscribed = 0;
        for room_id in handle.rooms() {
            if !desired.contains(room_id.as_str()) && self.rooms.unsubscribe(handle, &room_id) {
                unsubscribed += 1;
            }
        }

        let mut subscribed = 0;
        for room_id in circles {
            if !handle.is_in_room(room_id) && self.rooms.subscribe(handle, room_id) {
                subscribed += 1;
            }
        }
        (subscribed, unsubscribed)
    }

    /// Apply one (already admitted) client message
    pub fn handle_client_message(&self, handle: &Arc<ConnectionHandle>, message: ClientMessage) {
        handle.update_activity();
        WsMessageMetrics::record(message.kind());

        match message {
            ClientMessage::Ping => {
                handle.send_control(ControlMessage::Pong);
            }
            ClientMessage::Typing {
                circle_id,
                is_typing,
            } => {
                if !handle.is_in_room(&circle_id) {
                    handle.send_control(ControlMessage::error(
                        "not_a_member",
                        format!("not subscribed to circle {}", circle_id),
                    ));
                    return;
                }
                let envelope = Envelope::to_room(
                    EventType::TypingIndicator,
                    circle_id.clone(),
                    json!({
                        "user_id": handle.user_id,
                        "circle_id": circle_id,
                        "is_typing": is_typing,
                    }),
                );
                self.dispatcher.dispatch_except(&envelope, Some(handle.id));
            }
            ClientMessage::Location {
                latitude,
                longitude,
                accuracy,
                battery,
            } => {
                if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                    tracing::warn!(
                        connection_id = %handle.id,
                        latitude = latitude,
                        longitude = longitude,
                        "Location out of range, dropped"
                    );
                    handle.send_control(ControlMessage::error(
                        "invalid_location",
                        "latitude/longitude out of range",
                    ));
                    return;
                }

                let payload = json!({
                    "user_id": handle.user_id,
                    "latitude": latitude,
                    "longitude": longitude,
                    "accuracy": accuracy,
                    "battery": battery,
                    "recorded_at": chrono::Utc::now(),
                });
                for room_id in handle.rooms() {
                    let envelope =
                        Envelope::to_room(EventType::LocationUpdate, room_id, payload.clone());
                    self.dispatcher.dispatch_except(&envelope, Some(handle.id));
                }
            }
        }
    }

    /// Queue a heartbeat frame on every connection. Returns how many accepted it.
    pub fn send_heartbeats(&self) -> usize {
        self.registry
            .all_connections()
            .iter()
            .filter(|handle| handle.send_control(ControlMessage::Heartbeat).is_queued())
            .count()
    }

    /// Close connections idle for longer than `timeout_secs`
    pub fn disconnect_stale(&self, timeout_secs: u64) -> usize {
        self.registry
            .find_stale_connections(timeout_secs)
            .into_iter()
            .filter(|id| self.force_disconnect(*id, reasons::IDLE_TIMEOUT))
            .count()
    }

    async fn presence_pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PresenceChange>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => self.announce_presence(&change),
                    None => break,
                },
            }
        }
        tracing::debug!("Presence pump stopped");
    }

    fn announce_presence(&self, change: &PresenceChange) {
        let payload = match serde_json::to_value(change) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(user_id = %change.user_id, error = %e, "Failed to encode presence change");
                return;
            }
        };

        for room_id in &change.rooms {
            self.dispatcher.dispatch(&Envelope::to_room(
                EventType::PresenceChange,
                room_id.clone(),
                payload.clone(),
            ));
        }
    }

    async fn liveness_monitor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LivenessProbe>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                probe = rx.recv() => match probe {
                    Some(probe) => {
                        tokio::spawn(self.clone().run_probe(probe));
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Liveness monitor stopped");
    }

    /// After the grace period, a connection whose writer made no progress
    /// while items are still queued is disconnected.
    async fn run_probe(self: Arc<Self>, probe: LivenessProbe) {
        let grace = Duration::from_millis(self.config.dispatch.liveness_grace_ms);
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }

        let Some(handle) = self.registry.get(probe.connection_id) else {
            return;
        };

        let stalled =
            handle.writes_completed() == probe.writes_at_schedule && handle.queue_len() > 0;
        if stalled {
            tracing::warn!(
                connection_id = %handle.id,
                user_id = %handle.user_id,
                reason = ?probe.reason,
                queued = handle.queue_len(),
                "Connection failed liveness probe"
            );
            self.force_disconnect(handle.id, reasons::UNRESPONSIVE);
        } else {
            handle.end_probe();
            tracing::debug!(connection_id = %handle.id, "Connection passed liveness probe");
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomIndex> {
        &self.rooms
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.stats(),
            rooms: self.rooms.stats(),
            dispatch: self.dispatcher.stats(),
            online_users: self.presence.online_users().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::membership::StaticMembershipResolver;
    use crate::websocket::OutboundMessage;
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl AuthValidator for AcceptAll {
        async fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            Ok(Claims::new(token, 3600))
        }
    }

    fn hub_with(membership: Arc<StaticMembershipResolver>) -> Arc<Hub> {
        let config = HubConfig {
            offline_debounce: Duration::ZERO,
            ..Default::default()
        };
        Arc::new(Hub::new(config, Arc::new(AcceptAll), membership))
    }

    fn family() -> Arc<StaticMembershipResolver> {
        let membership = Arc::new(StaticMembershipResolver::new());
        membership.add_member("family", "alice");
        membership.add_member("family", "bob");
        membership
    }

    async fn drain(handle: &ConnectionHandle) -> Vec<String> {
        let mut frames = Vec::new();
        while handle.queue_len() > 0 {
            match handle.next_outbound().await {
                Some(OutboundMessage::Envelope { frame, .. }) => frames.push(frame.to_string()),
                Some(OutboundMessage::Control(c)) => {
                    frames.push(serde_json::to_string(&c).unwrap())
                }
                None => break,
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_connect_subscribes_rooms_and_greets() {
        let hub = hub_with(family());
        let handle = hub.connect("alice", None, &CancellationToken::new()).await.unwrap();

        assert!(handle.is_in_room("family"));
        assert!(hub.is_user_online("alice"));
        assert_eq!(hub.get_connected_users(), vec!["alice"]);

        let frames = drain(&handle).await;
        assert!(frames[0].contains("\"type\":\"connected\""));
        assert!(frames[0].contains("family"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = hub_with(family());
        let handle = hub.connect("alice", None, &CancellationToken::new()).await.unwrap();

        assert!(hub.disconnect(handle.id, reasons::CLIENT_CLOSED));
        assert!(!hub.disconnect(handle.id, reasons::CLIENT_CLOSED));
        assert!(handle.is_closed());
        assert_eq!(hub.rooms().subscriber_count("family"), 0);
        assert!(!hub.is_user_online("alice"));
    }

    #[tokio::test]
    async fn test_typing_not_echoed_to_sender() {
        let hub = hub_with(family());
        let cancel = CancellationToken::new();
        let alice = hub.connect("alice", None, &cancel).await.unwrap();
        let bob = hub.connect("bob", None, &cancel).await.unwrap();
        drain(&alice).await;
        drain(&bob).await;

        hub.handle_client_message(
            &alice,
            ClientMessage::Typing {
                circle_id: "family".into(),
                is_typing: true,
            },
        );

        assert_eq!(alice.queue_len(), 0);
        let frames = drain(&bob).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("typing_indicator"));
    }

    #[tokio::test]
    async fn test_typing_outside_room_is_refused() {
        let hub = hub_with(family());
        let alice = hub.connect("alice", None, &CancellationToken::new()).await.unwrap();
        drain(&alice).await;

        hub.handle_client_message(
            &alice,
            ClientMessage::Typing {
                circle_id: "work".into(),
                is_typing: true,
            },
        );
        let frames = drain(&alice).await;
        assert!(frames[0].contains("not_a_member"));
    }

    #[tokio::test]
    async fn test_ping_and_bad_location() {
        let hub = hub_with(family());
        let alice = hub.connect("alice", None, &CancellationToken::new()).await.unwrap();
        drain(&alice).await;

        hub.handle_client_message(&alice, ClientMessage::Ping);
        hub.handle_client_message(
            &alice,
            ClientMessage::Location {
                latitude: 123.0,
                longitude: 0.0,
                accuracy: None,
                battery: None,
            },
        );

        let frames = drain(&alice).await;
        assert!(frames[0].contains("pong"));
        assert!(frames[1].contains("invalid_location"));
    }

    #[tokio::test]
    async fn test_membership_change_reconciles_subscriptions() {
        let membership = family();
        let hub = hub_with(membership.clone());
        let bob = hub.connect("bob", None, &CancellationToken::new()).await.unwrap();

        membership.remove_member("family", "bob");
        membership.add_member("hiking", "bob");

        let update = hub.membership_changed("family", None).await;
        assert_eq!(update.users, 1);
        assert_eq!(update.subscribed, 1);
        assert_eq!(update.unsubscribed, 1);
        assert!(!bob.is_in_room("family"));
        assert!(bob.is_in_room("hiking"));
        assert_eq!(hub.rooms().cached_circles("bob"), Some(vec!["hiking".to_string()]));
    }

    #[tokio::test]
    async fn test_stale_connections_are_closed() {
        let hub = hub_with(family());
        let alice = hub.connect("alice", None, &CancellationToken::new()).await.unwrap();
        alice.set_last_activity(chrono::Utc::now() - chrono::Duration::seconds(600));

        assert_eq!(hub.disconnect_stale(120), 1);
        assert_eq!(alice.close_reason().as_deref(), Some(reasons::IDLE_TIMEOUT));
    }

    #[tokio::test]
    async fn test_stop_closes_everything_and_refuses_new_connections() {
        let hub = hub_with(family());
        hub.start();
        let alice = hub.connect("alice", None, &CancellationToken::new()).await.unwrap();

        hub.stop().await;
        assert!(alice.is_closed());
        assert_eq!(alice.close_reason().as_deref(), Some(reasons::SERVER_SHUTDOWN));
        assert!(hub.registry().is_empty());

        let err = hub
            .connect("bob", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_membership_cache_dropped_with_last_device() {
        let hub = hub_with(family());
        let cancel = CancellationToken::new();
        let phone = hub.connect("alice", None, &cancel).await.unwrap();
        let laptop = hub.connect("alice", None, &cancel).await.unwrap();

        hub.disconnect(phone.id, reasons::CLIENT_CLOSED);
        assert!(hub.rooms().cached_circles("alice").is_some());

        hub.disconnect(laptop.id, reasons::CLIENT_CLOSED);
        assert!(hub.rooms().cached_circles("alice").is_none());

        for i in 0..50 {
            let user = format!("user-{}", i);
            let handle = hub.connect(&user, None, &cancel).await.unwrap();
            hub.disconnect(handle.id, reasons::CLIENT_CLOSED);
        }
        assert!(hub.registry().is_empty());
        assert_eq!(hub.rooms().stats().cached_users, 0);
    }

    /// Stops the hub from inside the membership lookup, after the lookup
    /// has already been polled past the shutdown check.
    struct StopDuringLookup {
        shutdown: Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl MembershipResolver for StopDuringLookup {
        async fn circles_for_user(
            &self,
            _user_id: &str,
        ) -> Result<Vec<String>, crate::membership::MembershipError> {
            if let Some(token) = self.shutdown.lock().as_ref() {
                token.cancel();
            }
            Ok(vec!["family".to_string()])
        }

        async fn members_of_circle(
            &self,
            _circle_id: &str,
        ) -> Result<Vec<String>, crate::membership::MembershipError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_admit_racing_stop_leaves_no_connection() {
        let membership = Arc::new(StopDuringLookup {
            shutdown: Mutex::new(None),
        });
        let hub = Arc::new(Hub::new(
            HubConfig::default(),
            Arc::new(AcceptAll),
            membership.clone(),
        ));
        *membership.shutdown.lock() = Some(hub.shutdown.clone());

        let err = hub
            .connect("alice", None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HubError::ShuttingDown));
        assert!(hub.registry().is_empty());
        assert_eq!(hub.rooms().subscriber_count("family"), 0);
        assert!(hub.rooms().cached_circles("alice").is_none());
    }
}
