use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use shared::{
    domain::{RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError, Receiver, Sender},
    Notify, RwLock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events a connection may have queued before it counts as too slow.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Unique id of one live connection. A user reconnecting gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the transport should do next for a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: Sender<Outbound>,
    overflow: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Queues an event without waiting. Returns `false` once the connection is
    /// gone or its queue is full; a full queue also evicts the connection.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.sender.try_send(Outbound::Event(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %self.user_id, connection_id = %self.id, "outbound queue full, evicting");
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queues an event, waiting for room in the queue. Used for traffic the
    /// connection asked for itself, such as history replay.
    pub async fn deliver(&self, event: ServerEvent) -> bool {
        self.sender.send(Outbound::Event(event)).await.is_ok()
    }

    pub fn close(&self) {
        if let Err(TrySendError::Full(_)) = self.sender.try_send(Outbound::Close) {
            self.overflow.notify_one();
        }
    }

    /// Resolves once the connection has been evicted for not keeping up, or
    /// closed while its queue was full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<UserId, ConnectionHandle>,
    rooms: HashMap<RoomId, HashMap<ConnectionId, ConnectionHandle>>,
    joined: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl RegistryInner {
    fn is_current(&self, handle: &ConnectionHandle) -> bool {
        self.sessions
            .get(&handle.user_id)
            .is_some_and(|current| current.id == handle.id)
    }

    fn drop_subscriptions(&mut self, connection_id: ConnectionId) {
        let Some(rooms) = self.joined.remove(&connection_id) else {
            return;
        };
        for room in rooms {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    self.rooms.remove(&room);
                }
            }
        }
    }
}

/// Live sessions (one per user) and per-room subscriptions.
///
/// Everything sits behind a single lock so that replace, compare-and-remove
/// and fan-out observe one consistent view.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    queue_capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_capacity(OUTBOUND_QUEUE_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose connections each queue at most `queue_capacity` events.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a new connection for `user_id`, replacing any existing one.
    ///
    /// The displaced connection is told via `session_replaced` and then closed.
    pub async fn register(&self, user_id: UserId) -> (ConnectionHandle, Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let handle = ConnectionHandle {
            id: ConnectionId::new(),
            user_id,
            sender,
            overflow: Arc::new(Notify::new()),
        };

        let mut guard = self.inner.write().await;
        if let Some(previous) = guard.sessions.insert(user_id, handle.clone()) {
            guard.drop_subscriptions(previous.id);
            previous.send(ServerEvent::SessionReplaced);
            previous.close();
            info!(%user_id, old = %previous.id, new = %handle.id, "session replaced");
        } else {
            info!(%user_id, connection_id = %handle.id, "session registered");
        }

        (handle, receiver)
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.inner.read().await.sessions.get(&user_id).cloned()
    }

    /// Removes the session only if `handle` is still the registered one, so a
    /// late disconnect cannot evict a newer session. Subscriptions held by
    /// `handle` are always dropped. Returns whether the session entry was removed.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut guard = self.inner.write().await;
        guard.drop_subscriptions(handle.id);
        if guard.is_current(handle) {
            guard.sessions.remove(&handle.user_id);
            info!(user_id = %handle.user_id, connection_id = %handle.id, "session unregistered");
            true
        } else {
            debug!(user_id = %handle.user_id, connection_id = %handle.id, "stale unregister ignored");
            false
        }
    }

    pub async fn is_current(&self, handle: &ConnectionHandle) -> bool {
        self.inner.read().await.is_current(handle)
    }

    /// Subscribes `handle` to `room`. Returns `false` if the handle is no longer
    /// the user's live session, in which case nothing changes.
    pub async fn subscribe(&self, handle: &ConnectionHandle, room: RoomId) -> bool {
        let mut guard = self.inner.write().await;
        if !guard.is_current(handle) {
            return false;
        }
        guard
            .rooms
            .entry(room)
            .or_default()
            .insert(handle.id, handle.clone());
        guard.joined.entry(handle.id).or_default().insert(room);
        debug!(
            %room,
            connection_id = %handle.id,
            subscribers = guard.rooms.get(&room).map(|m| m.len()).unwrap_or(0),
            "subscribed"
        );
        true
    }

    pub async fn unsubscribe(&self, handle: &ConnectionHandle, room: RoomId) -> bool {
        let mut guard = self.inner.write().await;
        let removed = guard
            .joined
            .get_mut(&handle.id)
            .is_some_and(|rooms| rooms.remove(&room));
        if let Some(members) = guard.rooms.get_mut(&room) {
            members.remove(&handle.id);
            if members.is_empty() {
                guard.rooms.remove(&room);
            }
        }
        removed
    }

    pub async fn is_subscribed(&self, handle: &ConnectionHandle, room: RoomId) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains_key(&handle.id))
    }

    pub async fn subscriber_count(&self, room: RoomId) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Sends `event` to every connection subscribed to `room`. Connections whose
    /// receiver is gone, or whose queue is full, are pruned from the room; a
    /// slow member misses the event rather than buffering without limit.
    /// Returns the number of recipients.
    pub async fn broadcast(&self, room: RoomId, event: ServerEvent) -> usize {
        let mut guard = self.inner.write().await;
        let Some(members) = guard.rooms.get_mut(&room) else {
            return 0;
        };

        let mut dead = Vec::new();
        for (id, handle) in members.iter() {
            if !handle.send(event.clone()) {
                dead.push(*id);
            }
        }
        for id in &dead {
            members.remove(id);
        }
        let delivered = members.len();
        if members.is_empty() {
            guard.rooms.remove(&room);
        }
        for id in dead {
            if let Some(rooms) = guard.joined.get_mut(&id) {
                rooms.remove(&room);
            }
        }

        debug!(%room, event = event.name(), delivered, "broadcast");
        delivered
    }
}

#[cfg(test)]
#[path = "tests/sessions_tests.rs"]
mod tests;
