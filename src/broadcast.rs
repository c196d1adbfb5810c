//! Connection registry and broadcaster.
//!
//! Each live push channel is one connection, owned by a user and subscribed
//! to any number of conversations. Delivery is a non-blocking `try_send` into
//! the connection's queue. A closed queue means the client is gone: the
//! connection is removed from every index before the send call returns, so
//! the subscription index never points at a missing connection past one
//! broadcast. A full queue counts as a failed push but keeps the connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::Listeners;
use crate::protocol::PushEvent;

pub type EventSender = mpsc::Sender<Arc<PushEvent>>;
pub type EventReceiver = mpsc::Receiver<Arc<PushEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client or the server closed the channel.
    Closed,
    /// A push found the channel closed.
    PushFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected {
        connection_id: String,
        user_id: String,
    },
    Disconnected {
        connection_id: String,
        user_id: String,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub total_subscribers: usize,
}

struct Connection {
    owner: String,
    subscriptions: HashSet<String>,
    sender: EventSender,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, Connection>,
    by_user: HashMap<String, HashSet<String>>,
    by_conversation: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    fn remove(&mut self, connection_id: &str) -> Option<Connection> {
        let conn = self.connections.remove(connection_id)?;
        for conversation_id in &conn.subscriptions {
            if let Some(set) = self.by_conversation.get_mut(conversation_id) {
                set.remove(connection_id);
                if set.is_empty() {
                    self.by_conversation.remove(conversation_id);
                }
            }
        }
        if let Some(set) = self.by_user.get_mut(&conn.owner) {
            set.remove(connection_id);
            if set.is_empty() {
                self.by_user.remove(&conn.owner);
            }
        }
        Some(conn)
    }

    fn senders<'a, I>(&self, ids: I) -> Vec<(String, EventSender)>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter_map(|id| {
                self.connections
                    .get(id)
                    .map(|c| (id.clone(), c.sender.clone()))
            })
            .collect()
    }
}

pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    listeners: Listeners<RegistryEvent>,
    channel_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            listeners: Listeners::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn listeners(&self) -> &Listeners<RegistryEvent> {
        &self.listeners
    }

    /// Create a push channel for `user_id`, register it and queue the
    /// `connected` event.
    pub fn open(&self, user_id: &str) -> (String, EventReceiver) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let connection_id = Uuid::new_v4().to_string();
        // fresh channel, cannot be full
        let _ = tx.try_send(Arc::new(PushEvent::connected(&connection_id)));
        self.add_connection(&connection_id, user_id, tx);
        (connection_id, rx)
    }

    /// Register an existing sender. Re-adding an id replaces the old entry.
    pub fn add_connection(&self, connection_id: &str, owner_user_id: &str, sender: EventSender) {
        let replaced = {
            let mut state = self.state.lock();
            let replaced = state.remove(connection_id);
            state.connections.insert(
                connection_id.to_string(),
                Connection {
                    owner: owner_user_id.to_string(),
                    subscriptions: HashSet::new(),
                    sender,
                },
            );
            state
                .by_user
                .entry(owner_user_id.to_string())
                .or_default()
                .insert(connection_id.to_string());
            replaced
        };
        if let Some(old) = replaced {
            self.notify_removed(connection_id, old.owner, DisconnectReason::Closed);
        }
        info!(connection_id, user_id = owner_user_id, "connection opened");
        self.listeners.emit(&RegistryEvent::Connected {
            connection_id: connection_id.to_string(),
            user_id: owner_user_id.to_string(),
        });
    }

    pub fn remove_connection(&self, connection_id: &str) -> bool {
        self.remove_with_reason(connection_id, DisconnectReason::Closed)
    }

    fn remove_with_reason(&self, connection_id: &str, reason: DisconnectReason) -> bool {
        let removed = self.state.lock().remove(connection_id);
        match removed {
            Some(conn) => {
                self.notify_removed(connection_id, conn.owner, reason);
                true
            }
            None => false,
        }
    }

    fn notify_removed(&self, connection_id: &str, user_id: String, reason: DisconnectReason) {
        match reason {
            DisconnectReason::Closed => info!(connection_id, %user_id, "connection closed"),
            DisconnectReason::PushFailed => {
                warn!(connection_id, %user_id, "push failed, connection removed")
            }
        }
        self.listeners.emit(&RegistryEvent::Disconnected {
            connection_id: connection_id.to_string(),
            user_id,
            reason,
        });
    }

    /// Returns false when the connection is unknown.
    pub fn subscribe(&self, conversation_id: &str, connection_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(connection_id) else {
            return false;
        };
        conn.subscriptions.insert(conversation_id.to_string());
        state
            .by_conversation
            .entry(conversation_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection_id, conversation_id, "subscribed");
        true
    }

    /// Returns false when the connection was not subscribed.
    pub fn unsubscribe(&self, conversation_id: &str, connection_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(connection_id) else {
            return false;
        };
        if !conn.subscriptions.remove(conversation_id) {
            return false;
        }
        if let Some(set) = state.by_conversation.get_mut(conversation_id) {
            set.remove(connection_id);
            if set.is_empty() {
                state.by_conversation.remove(conversation_id);
            }
        }
        debug!(connection_id, conversation_id, "unsubscribed");
        true
    }

    pub fn send_to_conversation(&self, conversation_id: &str, event: PushEvent) -> DeliveryReport {
        let targets = {
            let state = self.state.lock();
            match state.by_conversation.get(conversation_id) {
                Some(ids) => state.senders(ids),
                None => Vec::new(),
            }
        };
        self.deliver(targets, Arc::new(event))
    }

    /// Push to every connection of `user_id` (all tabs and devices).
    pub fn send_to_user(&self, user_id: &str, event: PushEvent) -> DeliveryReport {
        let targets = {
            let state = self.state.lock();
            match state.by_user.get(user_id) {
                Some(ids) => state.senders(ids),
                None => Vec::new(),
            }
        };
        self.deliver(targets, Arc::new(event))
    }

    pub fn broadcast_all(&self, event: PushEvent) -> DeliveryReport {
        let targets = {
            let state = self.state.lock();
            state.senders(state.connections.keys())
        };
        self.deliver(targets, Arc::new(event))
    }

    fn deliver(&self, targets: Vec<(String, EventSender)>, event: Arc<PushEvent>) -> DeliveryReport {
        let mut report = DeliveryReport {
            total_subscribers: targets.len(),
            ..DeliveryReport::default()
        };
        let mut dead = Vec::new();
        for (connection_id, sender) in targets {
            match sender.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.failed += 1;
                    debug!(%connection_id, "push queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    report.failed += 1;
                    dead.push(connection_id);
                }
            }
        }
        for connection_id in dead {
            self.remove_with_reason(&connection_id, DisconnectReason::PushFailed);
        }
        report
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.state.lock().connections.contains_key(connection_id)
    }

    pub fn owner_of(&self, connection_id: &str) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(connection_id)
            .map(|c| c.owner.clone())
    }

    pub fn subscribers(&self, conversation_id: &str) -> Vec<String> {
        self.state
            .lock()
            .by_conversation
            .get(conversation_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push a `heartbeat` to every connection on a fixed interval until
    /// cancelled. Dead connections are reaped by the push itself.
    pub fn start_heartbeat_loop(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.broadcast_all(PushEvent::heartbeat());
                        if report.failed > 0 {
                            debug!(
                                delivered = report.delivered,
                                failed = report.failed,
                                "heartbeat round"
                            );
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("heartbeat loop stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;

    fn typing() -> PushEvent {
        PushEvent::typing("c1", "alice")
    }

    #[tokio::test]
    async fn open_queues_connected_event() {
        let registry = ConnectionRegistry::new(8);
        let (id, mut rx) = registry.open("alice");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Connected);
        assert_eq!(first.data["connectionId"], id.as_str());
        assert_eq!(registry.owner_of(&id).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn conversation_multicast_reaches_subscribers_only() {
        let registry = ConnectionRegistry::new(8);
        let (a, mut rx_a) = registry.open("alice");
        let (_b, mut rx_b) = registry.open("bruno");
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();
        assert!(registry.subscribe("c1", &a));

        let report = registry.send_to_conversation("c1", typing());
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                failed: 0,
                total_subscribers: 1
            }
        );
        assert_eq!(rx_a.recv().await.unwrap().event_type, EventType::Typing);
        assert!(rx_b.try_recv().is_err());
        assert!(!registry.subscribe("c1", "missing"));
    }

    #[tokio::test]
    async fn send_to_user_covers_every_device() {
        let registry = ConnectionRegistry::new(8);
        let (_, _rx1) = registry.open("alice");
        let (_, _rx2) = registry.open("alice");
        let report = registry.send_to_user("alice", typing());
        assert_eq!(report.delivered, 2);
        assert_eq!(registry.send_to_user("nobody", typing()).total_subscribers, 0);
    }

    #[tokio::test]
    async fn closed_channel_is_removed_from_every_index() {
        let registry = ConnectionRegistry::new(8);
        let (dead, rx_dead) = registry.open("alice");
        let (_live, _rx_live) = registry.open("alice");
        registry.subscribe("c1", &dead);
        registry.subscribe("c2", &dead);
        drop(rx_dead);

        let report = registry.send_to_user("alice", typing());
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);

        assert!(!registry.contains(&dead));
        assert!(registry.subscribers("c1").is_empty());
        assert!(registry.subscribers("c2").is_empty());
        assert_eq!(registry.send_to_user("alice", typing()).total_subscribers, 1);
    }

    #[tokio::test]
    async fn full_queue_fails_but_keeps_connection() {
        let registry = ConnectionRegistry::new(1);
        // the connected event fills the only slot
        let (id, _rx) = registry.open("alice");
        let report = registry.send_to_user("alice", typing());
        assert_eq!(report.failed, 1);
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn unsubscribe_and_remove_keep_indexes_consistent() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.open("alice");
        registry.subscribe("c1", &id);
        assert!(registry.unsubscribe("c1", &id));
        assert!(!registry.unsubscribe("c1", &id));
        assert!(registry.subscribers("c1").is_empty());

        registry.subscribe("c1", &id);
        assert!(registry.remove_connection(&id));
        assert!(!registry.remove_connection(&id));
        assert!(registry.subscribers("c1").is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn lifecycle_listeners_see_push_failures() {
        let registry = ConnectionRegistry::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.listeners().subscribe(move |e: &RegistryEvent| {
            sink.lock().push(e.clone());
            Ok(())
        });

        let (id, rx) = registry.open("alice");
        drop(rx);
        registry.send_to_user("alice", typing());

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1],
            RegistryEvent::Disconnected {
                connection_id: id,
                user_id: "alice".into(),
                reason: DisconnectReason::PushFailed,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_pushes_until_cancelled() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let (_, mut rx) = registry.open("alice");
        rx.recv().await.unwrap();

        let cancel = CancellationToken::new();
        let handle =
            Arc::clone(&registry).start_heartbeat_loop(Duration::from_secs(25), cancel.clone());

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::Heartbeat);

        cancel.cancel();
        handle.await.unwrap();
    }
}
