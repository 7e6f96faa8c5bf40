use chrono::{DateTime, Utc};
use palaver_proto::{OutboundFrame, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// The live binding between a user and one realtime connection.
///
/// Holds the outbound queue for that connection; frames pushed here are
/// stamped with the connection's own sequence.
pub struct SessionHandle {
    pub user_id: String,
    pub transport_id: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundFrame>,
    next_sequence: AtomicU64,
}

impl SessionHandle {
    pub fn new(
        user_id: String,
        transport_id: String,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        SessionHandle {
            user_id,
            transport_id,
            connected_at: Utc::now(),
            sender,
            next_sequence: AtomicU64::new(1),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Queues an event for this connection. Returns false if the connection
    /// is gone; the event is dropped silently.
    pub async fn push(&self, event: ServerEvent) -> bool {
        let frame = OutboundFrame::new(self.next_sequence(), event);
        let delivered = self.sender.send(frame).await.is_ok();
        if !delivered {
            debug!(user = %self.user_id, "push to closed session dropped");
        }
        delivered
    }

    /// At-most-once push: drops the event when the queue is full or closed.
    pub fn push_now(&self, event: ServerEvent) -> bool {
        let frame = OutboundFrame::new(self.next_sequence(), event);
        self.sender.try_send(frame).is_ok()
    }
}

/// Maps each user to its single active session.
///
/// Register is last-writer-wins: a superseded session's socket keeps running
/// but no longer receives targeted pushes. Unregister only removes the
/// mapping when the transport still matches, so a stale disconnect cannot
/// evict a fresh reconnect.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let mut connections = self.connections.write().await;
        connections.insert(handle.user_id.clone(), handle)
    }

    pub async fn unregister(&self, user_id: &str, transport_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(current) if current.transport_id == transport_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<Arc<SessionHandle>> {
        let connections = self.connections.read().await;
        connections.get(user_id).cloned()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections.contains_key(user_id)
    }
}

/// Conversation view subscriptions, the scope for typing relay.
#[derive(Default)]
pub struct RoomIndex {
    rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, conversation_id: &str, user_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub async fn leave(&self, conversation_id: &str, user_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(conversation_id) {
            members.remove(user_id);
            if members.is_empty() {
                rooms.remove(conversation_id);
            }
        }
    }

    pub async fn leave_all(&self, user_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(user_id);
            !members.is_empty()
        });
    }

    pub async fn members(&self, conversation_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms
            .get(conversation_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, conversation_id: &str, user_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(conversation_id)
            .is_some_and(|members| members.contains(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str, transport: &str) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Arc::new(SessionHandle::new(
                user.to_string(),
                transport.to_string(),
                tx,
            )),
            rx,
        )
    }

    #[tokio::test]
    async fn register_is_last_writer_wins() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = session("alice", "t1");
        let (second, mut second_rx) = session("alice", "t2");
        assert!(registry.register(first).await.is_none());
        let superseded = registry.register(second).await.expect("prior session");
        assert_eq!(superseded.transport_id, "t1");

        let current = registry.lookup("alice").await.expect("session");
        assert_eq!(current.transport_id, "t2");
        assert!(
            current
                .push(ServerEvent::UserOnline {
                    user_id: "bob".to_string(),
                })
                .await
        );
        assert!(second_rx.recv().await.is_some());
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_unregister_keeps_fresh_session() {
        let registry = ConnectionRegistry::new();
        let (first, _first_rx) = session("alice", "t1");
        let (second, _second_rx) = session("alice", "t2");
        registry.register(first).await;
        registry.register(second).await;
        // The old transport disconnects after the reconnect landed.
        assert!(!registry.unregister("alice", "t1").await);
        assert!(registry.is_online("alice").await);
        assert!(registry.unregister("alice", "t2").await);
        assert!(!registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn sequences_increase_per_connection() {
        let (handle, mut rx) = session("alice", "t1");
        handle
            .push(ServerEvent::UserOnline {
                user_id: "bob".to_string(),
            })
            .await;
        handle
            .push(ServerEvent::UserOffline {
                user_id: "bob".to_string(),
            })
            .await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn rooms_track_membership() {
        let rooms = RoomIndex::new();
        rooms.join("c1", "alice").await;
        rooms.join("c1", "bob").await;
        rooms.join("c2", "alice").await;
        assert!(rooms.contains("c1", "alice").await);
        let mut members = rooms.members("c1").await;
        members.sort();
        assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
        rooms.leave_all("alice").await;
        assert!(!rooms.contains("c1", "alice").await);
        assert!(!rooms.contains("c2", "alice").await);
        assert_eq!(rooms.members("c2").await, Vec::<String>::new());
    }
}
