// Websocket endpoint for the realtime hub. The upgrade carries the same
// bearer token as the HTTP API, and `join_project` checks membership
// before admitting the connection to a room: rooms are not a trusted
// network. Failures on this channel are logged and dropped; the client
// never receives an error over the socket.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::AppError,
    middleware::auth::{decode_claims, AuthUser},
    routes::chat::record_message,
    services::rooms::{should_deliver, ConnId, RoomEvent},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum ClientEvent {
    /// Data is the project id to join.
    JoinProject(String),
    SendMessage(SendMessagePayload),
    /// Opaque board-change signal, relayed to everyone else in the room.
    TaskUpdated(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    project_id: String,
    sender_id: String,
    sender_name: String,
    message: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let claims = match decode_claims(&query.token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(_) => return AppError::Unauthenticated.into_response(),
    };

    let user = AuthUser {
        id: claims.sub,
        email: claims.email,
        name: claims.name,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: AuthUser, state: AppState) {
    let conn_id: ConnId = Uuid::new_v4();
    let (sender, mut receiver) = socket.split();

    // Sender shared between the per-room forward tasks and the pong path
    let sender = Arc::new(tokio::sync::Mutex::new(sender));
    let mut forward_tasks = Vec::new();
    let mut joined: HashSet<String> = HashSet::new();

    tracing::debug!(conn = %conn_id, user = %user.id, "websocket connected");

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(conn = %conn_id, "unparseable ws event: {err}");
                        continue;
                    }
                };

                match event {
                    ClientEvent::JoinProject(project_id) => {
                        if let Some(rx) = join_room(&state, conn_id, &user, &project_id).await {
                            joined.insert(project_id);
                            forward_tasks.push(spawn_forwarder(rx, sender.clone(), conn_id));
                        }
                    }
                    ClientEvent::SendMessage(payload) => {
                        relay_message(&state, &user, &joined, payload).await;
                    }
                    ClientEvent::TaskUpdated(payload) => {
                        relay_task_update(&state, conn_id, &joined, payload).await;
                    }
                }
            }
            Message::Ping(data) => {
                let mut sender = sender.lock().await;
                let _ = sender.send(Message::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Disconnect removes the connection from all its rooms; broadcasts
    // triggered by its still-in-flight HTTP requests simply reach one
    // fewer recipient.
    state.rooms.leave(conn_id).await;
    for task in forward_tasks {
        task.abort();
    }

    tracing::debug!(conn = %conn_id, "websocket disconnected");
}

/// Admits an authenticated connection to a project room, checking
/// membership against the database first. Returns `None` when the caller
/// is not a member (refused, logged) or already joined (no-op); the
/// client is never signalled either way.
async fn join_room(
    state: &AppState,
    conn_id: ConnId,
    user: &AuthUser,
    project_id: &str,
) -> Option<broadcast::Receiver<RoomEvent>> {
    if !is_project_member(state, project_id, &user.id).await {
        tracing::warn!(
            conn = %conn_id,
            user = %user.id,
            project = %project_id,
            "join refused: not a project member"
        );
        return None;
    }

    state.rooms.join(conn_id, project_id).await
}

/// Relay pipeline for a chat submission: persist with a server timestamp,
/// then fan `receive_message` out to the whole room, sender included. If
/// the write fails the event is logged and dropped and nothing goes out.
async fn relay_message(
    state: &AppState,
    user: &AuthUser,
    joined: &HashSet<String>,
    payload: SendMessagePayload,
) {
    if !joined.contains(&payload.project_id) {
        tracing::warn!(
            user = %user.id,
            project = %payload.project_id,
            "send_message for a room this connection has not joined"
        );
        return;
    }

    // The connection is authenticated; the credential wins over the
    // client-asserted sender fields.
    if payload.sender_id != user.id {
        tracing::debug!(
            claimed = %payload.sender_id,
            actual = %user.id,
            claimed_name = %payload.sender_name,
            "sender id mismatch on send_message"
        );
    }

    match record_message(
        &state.db.pool,
        &payload.project_id,
        &user.id,
        &user.name,
        &payload.message,
    )
    .await
    {
        Ok(saved) => {
            let data = serde_json::to_value(&saved).unwrap_or_else(|_| json!({}));
            state
                .rooms
                .broadcast(&payload.project_id, RoomEvent::new("receive_message", data))
                .await;
        }
        Err(err) => {
            tracing::error!("failed to save chat message: {err}");
        }
    }
}

/// Relays a board-change signal to everyone else in the room. The payload
/// is only a cache-invalidation hint; receivers re-fetch the task list.
async fn relay_task_update(
    state: &AppState,
    conn_id: ConnId,
    joined: &HashSet<String>,
    payload: serde_json::Value,
) {
    let Some(project_id) = payload
        .get("project_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
    else {
        tracing::warn!(conn = %conn_id, "task_updated without project_id");
        return;
    };

    if !joined.contains(&project_id) {
        tracing::warn!(
            conn = %conn_id,
            project = %project_id,
            "task_updated for a room this connection has not joined"
        );
        return;
    }

    state
        .rooms
        .broadcast(
            &project_id,
            RoomEvent::excluding("task_updated", payload, conn_id),
        )
        .await;
}

/// Pulls the next event for a subscriber, riding out lag. A receiver that
/// falls behind the channel capacity misses the dropped events and keeps
/// going; `None` means the room was torn down.
async fn next_room_event(
    rx: &mut broadcast::Receiver<RoomEvent>,
    conn_id: ConnId,
) -> Option<RoomEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(conn = %conn_id, skipped, "client lagged behind room broadcast");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<RoomEvent>,
    sender: Arc<tokio::sync::Mutex<futures::stream::SplitSink<WebSocket, Message>>>,
    conn_id: ConnId,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = next_room_event(&mut rx, conn_id).await {
            if !should_deliver(&event, conn_id) {
                continue;
            }

            let frame = json!({ "event": event.name, "data": event.payload }).to_string();
            let mut sender = sender.lock().await;
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    })
}

async fn is_project_member(state: &AppState, project_id: &str, user_id: &str) -> bool {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM project_members WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_one(&state.db.pool)
    .await;

    match count {
        Ok(n) => n > 0,
        Err(err) => {
            tracing::error!("membership check failed: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, db::Database, services::rooms::RoomRegistry};
    use chrono::Utc;

    async fn test_state() -> AppState {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();

        AppState {
            db,
            config: Config {
                port: 0,
                database_url: String::new(),
                jwt_secret: "test-secret".to_string(),
            },
            rooms: RoomRegistry::new(),
        }
    }

    async fn seed_user(state: &AppState, id: &str, name: &str) -> AuthUser {
        let email = format!("{id}@example.com");
        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&email)
        .bind(name)
        .bind("unused")
        .bind(Utc::now().to_rfc3339())
        .execute(&state.db.pool)
        .await
        .unwrap();

        AuthUser {
            id: id.to_string(),
            email,
            name: name.to_string(),
        }
    }

    async fn seed_project(state: &AppState, id: &str, owner_id: &str) {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO projects (id, name, owner_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind("Sprint")
        .bind(owner_id)
        .bind(&now)
        .bind(&now)
        .execute(&state.db.pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO project_members (project_id, user_id) VALUES (?, ?)")
            .bind(id)
            .bind(owner_id)
            .execute(&state.db.pool)
            .await
            .unwrap();
    }

    fn joined(project_id: &str) -> HashSet<String> {
        HashSet::from([project_id.to_string()])
    }

    #[test]
    fn client_events_parse() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"join_project","data":"p1"}"#).unwrap();
        assert!(matches!(event, ClientEvent::JoinProject(ref id) if id == "p1"));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"send_message","data":{"project_id":"p1","sender_id":"u1","sender_name":"A","message":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::SendMessage(ref p) if p.message == "hi"));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"task_updated","data":{"project_id":"p1","status":"Done"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::TaskUpdated(_)));
    }

    #[tokio::test]
    async fn non_member_join_is_refused() {
        let state = test_state().await;
        let owner = seed_user(&state, "owner", "Owner").await;
        let intruder = seed_user(&state, "intruder", "Intruder").await;
        seed_project(&state, "p1", &owner.id).await;

        let rx = join_room(&state, Uuid::new_v4(), &intruder, "p1").await;
        assert!(rx.is_none());
        assert_eq!(state.rooms.member_count("p1").await, 0);

        // A member is admitted
        let rx = join_room(&state, Uuid::new_v4(), &owner, "p1").await;
        assert!(rx.is_some());
        assert_eq!(state.rooms.member_count("p1").await, 1);
    }

    #[tokio::test]
    async fn message_relay_persists_then_broadcasts() {
        let state = test_state().await;
        let owner = seed_user(&state, "owner", "Owner").await;
        seed_project(&state, "p1", &owner.id).await;

        let mut rx = state.rooms.join(Uuid::new_v4(), "p1").await.unwrap();

        relay_message(
            &state,
            &owner,
            &joined("p1"),
            SendMessagePayload {
                project_id: "p1".to_string(),
                sender_id: owner.id.clone(),
                sender_name: owner.name.clone(),
                message: "hi".to_string(),
            },
        )
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "receive_message");
        assert_eq!(event.payload["message"], "hi");
        assert_eq!(event.payload["sender"]["id"], "owner");
        // Delivered to the whole room, sender included
        assert_eq!(event.exclude, None);

        let persisted = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&state.db.pool)
            .await
            .unwrap();
        assert_eq!(persisted, 1);
    }

    #[tokio::test]
    async fn failed_persist_drops_the_broadcast() {
        let state = test_state().await;
        let owner = seed_user(&state, "owner", "Owner").await;
        seed_project(&state, "p1", &owner.id).await;

        let mut rx = state.rooms.join(Uuid::new_v4(), "p1").await.unwrap();

        // Make the insert fail underneath the relay
        sqlx::query("DROP TABLE messages")
            .execute(&state.db.pool)
            .await
            .unwrap();

        relay_message(
            &state,
            &owner,
            &joined("p1"),
            SendMessagePayload {
                project_id: "p1".to_string(),
                sender_id: owner.id.clone(),
                sender_name: owner.name.clone(),
                message: "lost".to_string(),
            },
        )
        .await;

        // Persist failed, so nothing was published
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relays_for_unjoined_rooms_are_dropped() {
        let state = test_state().await;
        let owner = seed_user(&state, "owner", "Owner").await;
        seed_project(&state, "p1", &owner.id).await;

        let mut rx = state.rooms.join(Uuid::new_v4(), "p1").await.unwrap();
        let not_joined = HashSet::new();

        relay_message(
            &state,
            &owner,
            &not_joined,
            SendMessagePayload {
                project_id: "p1".to_string(),
                sender_id: owner.id.clone(),
                sender_name: owner.name.clone(),
                message: "hi".to_string(),
            },
        )
        .await;

        relay_task_update(
            &state,
            Uuid::new_v4(),
            &not_joined,
            serde_json::json!({ "project_id": "p1" }),
        )
        .await;

        assert!(rx.try_recv().is_err());

        // Nothing was persisted either
        let persisted = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&state.db.pool)
            .await
            .unwrap();
        assert_eq!(persisted, 0);
    }

    #[tokio::test]
    async fn task_update_relays_payload_excluding_sender() {
        let state = test_state().await;
        let owner = seed_user(&state, "owner", "Owner").await;
        seed_project(&state, "p1", &owner.id).await;

        let sender_conn = Uuid::new_v4();
        state.rooms.join(sender_conn, "p1").await.unwrap();
        let mut rx = state.rooms.join(Uuid::new_v4(), "p1").await.unwrap();

        relay_task_update(
            &state,
            sender_conn,
            &joined("p1"),
            serde_json::json!({ "project_id": "p1", "status": "Done" }),
        )
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "task_updated");
        assert_eq!(event.payload["status"], "Done");
        assert_eq!(event.exclude, Some(sender_conn));

        // A payload without a project id has no room to go to
        relay_task_update(
            &state,
            sender_conn,
            &joined("p1"),
            serde_json::json!({ "status": "Done" }),
        )
        .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagged_receiver_skips_ahead_and_keeps_receiving() {
        let (tx, mut rx) = broadcast::channel(4);
        let conn = Uuid::new_v4();

        for seq in 0..10 {
            tx.send(RoomEvent::new(
                "task_updated",
                serde_json::json!({ "seq": seq }),
            ))
            .unwrap();
        }

        // The oldest six events were dropped; delivery resumes at the
        // earliest retained one instead of shutting the subscriber down.
        let event = next_room_event(&mut rx, conn).await.unwrap();
        assert_eq!(event.payload["seq"], 6);

        drop(tx);
        let mut remaining = 0;
        while next_room_event(&mut rx, conn).await.is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 3);
    }
}
