use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use haggle_domain::events::ChatEvent;
use haggle_domain::ports::realtime::ChatEventPublisher;
use tokio::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};

/// Events a socket may have queued before new ones are dropped for it.
pub const CONNECTION_QUEUE_CAPACITY: usize = 256;

/// Outbound side of one live socket.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub user_id: String,
    sender: Sender<ChatEvent>,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>) -> (Self, Receiver<ChatEvent>) {
        Self::with_capacity(user_id, CONNECTION_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, Receiver<ChatEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            connection_id: haggle_domain::util::uuid_v7_without_dashes(),
            user_id: user_id.into(),
            sender,
        };
        (handle, receiver)
    }

    /// Non-blocking. `false` when the socket task has gone away or has not
    /// drained its queue.
    pub fn send(&self, event: ChatEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    event = event.name(),
                    "connection queue full"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// user id → the single live connection for that user.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest connection wins. Returns the handle it displaced, if any.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections
            .write()
            .await
            .insert(handle.user_id.clone(), handle)
    }

    /// Removes the entry only while it still belongs to `connection_id`, so a
    /// late disconnect from an old socket leaves the newer one registered.
    pub async fn unregister(&self, user_id: &str, connection_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(current) if current.connection_id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(user_id).cloned()
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// conversation id → connections currently viewing it.
#[derive(Clone, Default)]
pub struct RoomDirectory {
    rooms: Arc<RwLock<HashMap<String, HashMap<String, ConnectionHandle>>>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, conversation_id: &str, handle: ConnectionHandle) -> bool {
        self.rooms
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .insert(handle.connection_id.clone(), handle)
            .is_none()
    }

    pub async fn leave(&self, conversation_id: &str, connection_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(conversation_id) else {
            return false;
        };
        let removed = room.remove(connection_id).is_some();
        if room.is_empty() {
            rooms.remove(conversation_id);
        }
        removed
    }

    /// Drops the connection from every room; returns how many it was in.
    pub async fn leave_all(&self, connection_id: &str) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut left = 0;
        rooms.retain(|_, room| {
            if room.remove(connection_id).is_some() {
                left += 1;
            }
            !room.is_empty()
        });
        left
    }

    pub async fn subscribers(&self, conversation_id: &str) -> Vec<ConnectionHandle> {
        self.rooms
            .read()
            .await
            .get(conversation_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

impl DeliveryReport {
    fn record(&mut self, handle: &ConnectionHandle, event: &ChatEvent) {
        if handle.send(event.clone()) {
            self.delivered += 1;
        } else {
            self.dropped += 1;
            tracing::debug!(
                connection_id = %handle.connection_id,
                user_id = %handle.user_id,
                event = event.name(),
                "dropping event for connection"
            );
        }
    }
}

/// Fans committed events out to room subscribers and to participants'
/// registered connections, each connection at most once per event.
#[derive(Clone)]
pub struct Broadcaster {
    presence: PresenceRegistry,
    rooms: RoomDirectory,
}

impl Broadcaster {
    pub fn new(presence: PresenceRegistry, rooms: RoomDirectory) -> Self {
        Self { presence, rooms }
    }

    pub async fn deliver(&self, participants: &[String], event: &ChatEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut reached = HashSet::new();

        for handle in self.rooms.subscribers(event.conversation_id()).await {
            if reached.insert(handle.connection_id.clone()) {
                report.record(&handle, event);
            }
        }
        for participant in participants {
            let Some(handle) = self.presence.lookup(participant).await else {
                continue;
            };
            if reached.insert(handle.connection_id.clone()) {
                report.record(&handle, event);
            }
        }

        record_metrics(event, report);
        report
    }

    /// Room-only relay for ephemeral client signals such as typing.
    pub async fn relay_to_room(
        &self,
        event: &ChatEvent,
        except_connection_id: &str,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for handle in self.rooms.subscribers(event.conversation_id()).await {
            if handle.connection_id != except_connection_id {
                report.record(&handle, event);
            }
        }
        record_metrics(event, report);
        report
    }
}

impl ChatEventPublisher for Broadcaster {
    fn publish(
        &self,
        participants: &[String],
        event: ChatEvent,
    ) -> haggle_domain::ports::BoxFuture<'_, ()> {
        let participants = participants.to_vec();
        Box::pin(async move {
            let report = self.deliver(&participants, &event).await;
            tracing::debug!(
                event = event.name(),
                conversation_id = %event.conversation_id(),
                delivered = report.delivered,
                dropped = report.dropped,
                "chat event published"
            );
        })
    }
}

fn record_metrics(event: &ChatEvent, report: DeliveryReport) {
    metrics::counter!(
        "haggle_realtime_deliveries_total",
        "event" => event.name(),
        "outcome" => "delivered"
    )
    .increment(report.delivered as u64);
    if report.dropped > 0 {
        metrics::counter!(
            "haggle_realtime_deliveries_total",
            "event" => event.name(),
            "outcome" => "dropped"
        )
        .increment(report.dropped as u64);
    }
}
