//! Client registry, session rooms, and parallel broadcast.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::hub::envelope::{Envelope, MessageType};
use crate::hub::transport::ClientTransport;
use crate::hub::CLOSE_UNKNOWN_SESSION;
use crate::utils::{json_map, JsonMap};

/// Capability the hub uses to validate session ids on connect.
///
/// Implemented by the session store; test hubs may run without one, in
/// which case every session id is accepted.
pub trait SessionDirectory: Send + Sync {
    fn session_exists(&self, session_id: &str) -> bool;
}

/// Book-keeping for one connected client.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub transport: Arc<dyn ClientTransport>,
    pub client_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Outcome of one broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
}

/// Connection counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: usize,
    pub active_sessions: usize,
    pub sessions: std::collections::BTreeMap<String, usize>,
}

#[derive(Default)]
struct HubInner {
    connections: FxHashMap<String, ConnectionInfo>,
    rooms: FxHashMap<String, FxHashSet<String>>,
}

/// Room-based fan-out hub for session lifecycle events.
///
/// One lock guards the registry; broadcasts snapshot room membership
/// under the lock, then send in parallel without holding it. A failed
/// send disconnects the client — the hub never surfaces transport errors
/// to callers.
pub struct SessionHub {
    directory: Option<Arc<dyn SessionDirectory>>,
    inner: Mutex<HubInner>,
}

impl SessionHub {
    /// Hub validating session ids against the given directory.
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        Self {
            directory: Some(directory),
            inner: Mutex::new(HubInner::default()),
        }
    }

    /// Hub accepting every session id. Useful in tests and embedders
    /// that validate sessions upstream.
    pub fn unchecked() -> Self {
        Self {
            directory: None,
            inner: Mutex::new(HubInner::default()),
        }
    }

    /// Register a client and add it to its session room.
    ///
    /// Unknown sessions are rejected by closing the transport with code
    /// 4004. Other room members receive `join_session`.
    pub async fn connect(
        &self,
        transport: Arc<dyn ClientTransport>,
        client_id: &str,
        session_id: &str,
    ) -> bool {
        if let Some(directory) = &self.directory {
            if !directory.session_exists(session_id) {
                warn!(client = client_id, session = session_id, "rejecting unknown session");
                transport.close(CLOSE_UNKNOWN_SESSION, "unknown session").await;
                return false;
            }
        }
        {
            let mut inner = self.inner.lock();
            inner.connections.insert(
                client_id.to_string(),
                ConnectionInfo {
                    transport,
                    client_id: client_id.to_string(),
                    session_id: session_id.to_string(),
                    connected_at: Utc::now(),
                    last_heartbeat: None,
                },
            );
            inner
                .rooms
                .entry(session_id.to_string())
                .or_default()
                .insert(client_id.to_string());
        }
        info!(client = client_id, session = session_id, "client connected");
        self.broadcast_session(
            session_id,
            MessageType::JoinSession,
            json_map([
                ("client_id", json!(client_id)),
                ("session_id", json!(session_id)),
            ]),
            Some(client_id),
        )
        .await;
        true
    }

    /// Remove a client and notify its room.
    pub async fn disconnect(&self, client_id: &str) {
        let Some(session_id) = self.remove_client(client_id) else {
            return;
        };
        info!(client = client_id, session = %session_id, "client disconnected");
        self.broadcast_session(
            &session_id,
            MessageType::LeaveSession,
            json_map([
                ("client_id", json!(client_id)),
                ("session_id", json!(session_id)),
            ]),
            None,
        )
        .await;
    }

    /// Send one envelope to one client. A transport failure disconnects
    /// the client and counts as a missed delivery.
    pub async fn send(&self, client_id: &str, envelope: &Envelope) -> bool {
        if self.raw_send(client_id, &envelope.to_wire()).await {
            return true;
        }
        // Failed send: drop the client and tell the room.
        self.disconnect(client_id).await;
        false
    }

    /// Fan an envelope out to every client in the session room.
    ///
    /// Membership is snapshotted under the lock; sends run in parallel
    /// without it. Clients whose transport fails are removed.
    pub async fn broadcast_session(
        &self,
        session_id: &str,
        message_type: MessageType,
        data: JsonMap,
        exclude: Option<&str>,
    ) -> BroadcastReport {
        let members: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .rooms
                .get(session_id)
                .map(|room| {
                    room.iter()
                        .filter(|id| exclude != Some(id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if members.is_empty() {
            return BroadcastReport {
                attempted: 0,
                delivered: 0,
            };
        }
        let wire = Envelope::new(message_type, session_id, data).to_wire();
        let sends = members.iter().map(|id| self.raw_send(id, &wire));
        let outcomes = join_all(sends).await;
        let mut delivered = 0;
        for (client_id, ok) in members.iter().zip(&outcomes) {
            if *ok {
                delivered += 1;
            } else {
                self.remove_client(client_id);
            }
        }
        debug!(
            session = session_id,
            kind = message_type.as_str(),
            attempted = members.len(),
            delivered,
            "session broadcast"
        );
        BroadcastReport {
            attempted: members.len(),
            delivered,
        }
    }

    /// Broadcast to every connected client, regardless of session.
    pub async fn broadcast_all(&self, message_type: MessageType, data: JsonMap) -> BroadcastReport {
        let members: Vec<String> = self.inner.lock().connections.keys().cloned().collect();
        let wire = Envelope::global(message_type, data).to_wire();
        let outcomes = join_all(members.iter().map(|id| self.raw_send(id, &wire))).await;
        let mut delivered = 0;
        for (client_id, ok) in members.iter().zip(&outcomes) {
            if *ok {
                delivered += 1;
            } else {
                self.remove_client(client_id);
            }
        }
        BroadcastReport {
            attempted: members.len(),
            delivered,
        }
    }

    /// Route an inbound client frame.
    ///
    /// Only `heartbeat` is normative: it refreshes the client's
    /// `last_heartbeat` and echoes a heartbeat envelope. Anything else is
    /// logged and dropped.
    pub async fn handle_client(&self, client_id: &str, raw: &str) {
        let parsed: Option<serde_json::Value> = serde_json::from_str(raw).ok();
        let kind = parsed
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        match kind.as_deref() {
            Some("heartbeat") => {
                let session_id = {
                    let mut inner = self.inner.lock();
                    let Some(connection) = inner.connections.get_mut(client_id) else {
                        return;
                    };
                    connection.last_heartbeat = Some(Utc::now());
                    connection.session_id.clone()
                };
                let reply = Envelope::new(
                    MessageType::Heartbeat,
                    session_id,
                    json_map([("status", json!("alive"))]),
                );
                self.send(client_id, &reply).await;
            }
            other => {
                debug!(client = client_id, kind = ?other, "ignoring client frame");
            }
        }
    }

    /// Disconnect clients whose heartbeat is older than the threshold.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .connections
                .values()
                .filter(|c| c.last_heartbeat.is_some_and(|hb| hb < cutoff))
                .map(|c| c.client_id.clone())
                .collect()
        };
        for client_id in &stale {
            info!(client = %client_id, "cleaning up stale connection");
            self.disconnect(client_id).await;
        }
        stale.len()
    }

    /// A client's registry entry.
    pub fn connection(&self, client_id: &str) -> Option<ConnectionInfo> {
        self.inner.lock().connections.get(client_id).cloned()
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.inner.lock();
        HubStats {
            total_connections: inner.connections.len(),
            active_sessions: inner.rooms.len(),
            sessions: inner
                .rooms
                .iter()
                .map(|(id, room)| (id.clone(), room.len()))
                .collect(),
        }
    }

    async fn raw_send(&self, client_id: &str, wire: &str) -> bool {
        let transport = self
            .inner
            .lock()
            .connections
            .get(client_id)
            .map(|c| Arc::clone(&c.transport));
        match transport {
            Some(transport) => transport.send_text(wire.to_string()).await.is_ok(),
            None => false,
        }
    }

    /// Drop a client from the registry and its room. Returns the session
    /// it belonged to. No broadcasts happen here.
    fn remove_client(&self, client_id: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let connection = inner.connections.remove(client_id)?;
        let session_id = connection.session_id;
        if let Some(room) = inner.rooms.get_mut(&session_id) {
            room.remove(client_id);
            if room.is_empty() {
                inner.rooms.remove(&session_id);
            }
        }
        Some(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::transport::{ChannelTransport, DeadTransport};

    fn decode(wire: &str) -> Envelope {
        serde_json::from_str(wire).unwrap()
    }

    #[tokio::test]
    async fn connect_and_broadcast_reaches_room() {
        let hub = SessionHub::unchecked();
        let (ta, rx_a) = ChannelTransport::pair();
        let (tb, rx_b) = ChannelTransport::pair();
        assert!(hub.connect(ta, "a", "s1").await);
        assert!(hub.connect(tb, "b", "s1").await);

        // "a" saw b's join notification.
        let joined = decode(&rx_a.recv_async().await.unwrap());
        assert_eq!(joined.message_type, MessageType::JoinSession);
        assert_eq!(joined.data["client_id"], "b");

        let report = hub
            .broadcast_session("s1", MessageType::TraceLog, JsonMap::new(), None)
            .await;
        assert_eq!(report, BroadcastReport { attempted: 2, delivered: 2 });
        assert_eq!(
            decode(&rx_a.recv_async().await.unwrap()).message_type,
            MessageType::TraceLog
        );
        assert_eq!(
            decode(&rx_b.recv_async().await.unwrap()).message_type,
            MessageType::TraceLog
        );
    }

    #[tokio::test]
    async fn unknown_session_is_closed_with_4004() {
        struct NoSessions;
        impl SessionDirectory for NoSessions {
            fn session_exists(&self, _session_id: &str) -> bool {
                false
            }
        }
        let hub = SessionHub::new(Arc::new(NoSessions));
        let (transport, _rx) = ChannelTransport::pair();
        let accepted = hub.connect(Arc::clone(&transport) as _, "x", "ghost").await;
        assert!(!accepted);
        assert_eq!(
            transport.close_frame(),
            Some((CLOSE_UNKNOWN_SESSION, "unknown session".to_string()))
        );
        assert_eq!(hub.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn send_failure_disconnects_client() {
        let hub = SessionHub::unchecked();
        let (ok_transport, rx) = ChannelTransport::pair();
        hub.connect(ok_transport, "alive", "s1").await;
        hub.connect(Arc::new(DeadTransport), "dead", "s1").await;
        assert_eq!(hub.stats().total_connections, 2);

        let report = hub
            .broadcast_session("s1", MessageType::TraceLog, JsonMap::new(), None)
            .await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert!(hub.connection("dead").is_none());
        // Alive client got the join frame plus the broadcast.
        let mut kinds = Vec::new();
        while let Ok(wire) = rx.try_recv() {
            kinds.push(decode(&wire).message_type);
        }
        assert!(kinds.contains(&MessageType::TraceLog));
    }

    #[tokio::test]
    async fn disconnect_broadcasts_leave_and_cleans_rooms() {
        let hub = SessionHub::unchecked();
        let (ta, rx_a) = ChannelTransport::pair();
        let (tb, _rx_b) = ChannelTransport::pair();
        hub.connect(ta, "a", "s1").await;
        hub.connect(tb, "b", "s1").await;
        let _ = rx_a.recv_async().await; // join frame

        hub.disconnect("b").await;
        let leave = decode(&rx_a.recv_async().await.unwrap());
        assert_eq!(leave.message_type, MessageType::LeaveSession);
        assert_eq!(leave.data["client_id"], "b");

        hub.disconnect("a").await;
        assert_eq!(hub.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn heartbeat_updates_and_echoes() {
        let hub = SessionHub::unchecked();
        let (transport, rx) = ChannelTransport::pair();
        hub.connect(transport, "c", "s1").await;
        assert!(hub.connection("c").unwrap().last_heartbeat.is_none());

        hub.handle_client("c", r#"{"type": "heartbeat"}"#).await;
        let echo = decode(&rx.recv_async().await.unwrap());
        assert_eq!(echo.message_type, MessageType::Heartbeat);
        assert_eq!(echo.data["status"], "alive");
        let hb = hub.connection("c").unwrap().last_heartbeat.unwrap();
        assert!(Utc::now() - hb < Duration::seconds(1));
    }

    #[tokio::test]
    async fn malformed_client_frames_are_ignored() {
        let hub = SessionHub::unchecked();
        let (transport, rx) = ChannelTransport::pair();
        hub.connect(transport, "c", "s1").await;
        hub.handle_client("c", "not json").await;
        hub.handle_client("c", r#"{"type": "agent_vote"}"#).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn stale_clients_are_cleaned_up() {
        let hub = SessionHub::unchecked();
        let (ta, _rx_a) = ChannelTransport::pair();
        let (tb, _rx_b) = ChannelTransport::pair();
        hub.connect(ta, "fresh", "s1").await;
        hub.connect(tb, "stale", "s1").await;
        hub.handle_client("fresh", r#"{"type": "heartbeat"}"#).await;
        // Backdate the stale client's heartbeat.
        {
            let mut inner = hub.inner.lock();
            inner.connections.get_mut("stale").unwrap().last_heartbeat =
                Some(Utc::now() - Duration::minutes(90));
        }
        let removed = hub.cleanup_stale(Duration::minutes(30)).await;
        assert_eq!(removed, 1);
        assert!(hub.connection("stale").is_none());
        assert!(hub.connection("fresh").is_some());
    }

    #[tokio::test]
    async fn broadcast_to_empty_room_is_harmless() {
        let hub = SessionHub::unchecked();
        let report = hub
            .broadcast_session("nobody", MessageType::TraceLog, JsonMap::new(), None)
            .await;
        assert_eq!(report, BroadcastReport { attempted: 0, delivered: 0 });
    }

    #[tokio::test]
    async fn broadcast_order_is_preserved_per_client() {
        let hub = SessionHub::unchecked();
        let (transport, rx) = ChannelTransport::pair();
        hub.connect(transport, "c", "s1").await;
        for kind in [
            MessageType::SimulationStarted,
            MessageType::LayerStarted,
            MessageType::LayerCompleted,
            MessageType::SimulationCompleted,
        ] {
            hub.broadcast_session("s1", kind, JsonMap::new(), None).await;
        }
        let mut seen = Vec::new();
        while let Ok(wire) = rx.try_recv() {
            seen.push(decode(&wire).message_type);
        }
        assert_eq!(
            seen,
            vec![
                MessageType::SimulationStarted,
                MessageType::LayerStarted,
                MessageType::LayerCompleted,
                MessageType::SimulationCompleted,
            ]
        );
    }
}
