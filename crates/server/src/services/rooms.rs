// Per-project rooms for realtime fan-out. Rooms are ephemeral: a room
// exists only while at least one client is joined, and nothing here is
// persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Identity of one websocket connection.
pub type ConnId = Uuid;

/// An event fanned out to a room. `exclude` names a connection the event
/// must not be delivered to (the relaying sender for `task_updated`).
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub name: String,
    pub payload: serde_json::Value,
    pub exclude: Option<ConnId>,
}

impl RoomEvent {
    pub fn new(name: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
            exclude: None,
        }
    }

    pub fn excluding(name: &str, payload: serde_json::Value, conn: ConnId) -> Self {
        Self {
            name: name.to_string(),
            payload,
            exclude: Some(conn),
        }
    }
}

/// Exclusion is applied at each subscriber, not at send time.
pub fn should_deliver(event: &RoomEvent, conn: ConnId) -> bool {
    event.exclude != Some(conn)
}

struct Room {
    members: HashSet<ConnId>,
    tx: broadcast::Sender<RoomEvent>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            members: HashSet::new(),
            tx,
        }
    }
}

/// Registry mapping project ids to rooms of connected clients.
///
/// Owned by `AppState` and created at server start; there is one per
/// process and broadcasts never cross process boundaries. Delivery is
/// best-effort: a client disconnected at broadcast time misses the event.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Adds a connection to a room, creating the room on first join.
    /// Returns `None` if the connection already joined this room, so a
    /// repeated `join_project` never produces duplicate deliveries. A
    /// connection may be in any number of rooms.
    pub async fn join(
        &self,
        conn: ConnId,
        project_id: &str,
    ) -> Option<broadcast::Receiver<RoomEvent>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(project_id.to_string())
            .or_insert_with(Room::new);

        if !room.members.insert(conn) {
            return None;
        }

        Some(room.tx.subscribe())
    }

    /// Removes a connection from every room it joined. Rooms left with no
    /// members are dropped. Invoked unconditionally on disconnect.
    pub async fn leave(&self, conn: ConnId) {
        let mut rooms = self.rooms.write().await;
        for room in rooms.values_mut() {
            room.members.remove(&conn);
        }
        rooms.retain(|_, room| !room.members.is_empty());
    }

    /// Best-effort fan-out to every current member of the room. No room,
    /// or no receivers left, is a silent no-op; there is no delivery
    /// confirmation and no retry.
    pub async fn broadcast(&self, project_id: &str, event: RoomEvent) {
        let rooms = self.rooms.read().await;
        match rooms.get(project_id) {
            Some(room) => {
                if room.tx.send(event).is_err() {
                    tracing::debug!(project_id, "broadcast to room with no receivers");
                }
            }
            None => {
                tracing::debug!(project_id, "broadcast to nonexistent room dropped");
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, project_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(project_id)
            .map(|r| r.members.len())
            .unwrap_or(0)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = RoomRegistry::new();
        let conn = Uuid::new_v4();

        assert!(registry.join(conn, "p1").await.is_some());
        assert!(registry.join(conn, "p1").await.is_none());
        assert_eq!(registry.member_count("p1").await, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_room_members_only() {
        let registry = RoomRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut rx_p = registry.join(a, "p").await.unwrap();
        let mut rx_q = registry.join(b, "q").await.unwrap();

        registry
            .broadcast("p", RoomEvent::new("task_updated", json!({"project_id": "p"})))
            .await;

        let event = rx_p.recv().await.unwrap();
        assert_eq!(event.name, "task_updated");
        assert!(rx_q.try_recv().is_err());
    }

    #[tokio::test]
    async fn sender_exclusion() {
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();

        let event = RoomEvent::excluding("task_updated", json!({}), sender);
        assert!(!should_deliver(&event, sender));
        assert!(should_deliver(&event, other));

        let inclusive = RoomEvent::new("receive_message", json!({}));
        assert!(should_deliver(&inclusive, sender));
    }

    #[tokio::test]
    async fn leave_prunes_empty_rooms() {
        let registry = RoomRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.join(a, "p").await;
        registry.join(b, "p").await;
        assert_eq!(registry.room_count().await, 1);

        registry.leave(a).await;
        assert_eq!(registry.member_count("p").await, 1);

        registry.leave(b).await;
        assert_eq!(registry.room_count().await, 0);

        // Broadcasting into the pruned room is a no-op
        registry
            .broadcast("p", RoomEvent::new("task_updated", json!({})))
            .await;
    }

    #[tokio::test]
    async fn connection_may_join_multiple_rooms() {
        let registry = RoomRegistry::new();
        let conn = Uuid::new_v4();

        let mut rx_p = registry.join(conn, "p").await.unwrap();
        let mut rx_q = registry.join(conn, "q").await.unwrap();

        registry
            .broadcast("q", RoomEvent::new("receive_message", json!({"message": "hi"})))
            .await;

        assert!(rx_q.recv().await.is_ok());
        assert!(rx_p.try_recv().is_err());

        registry.leave(conn).await;
        assert_eq!(registry.room_count().await, 0);
    }
}
