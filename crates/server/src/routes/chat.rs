use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::Result, middleware::auth::AuthUser, routes::projects::require_member, AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/:project_id", get(chat_history))
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SenderRef {
    pub id: String,
    pub name: String,
}

/// Chat message with its sender expanded. The realtime `receive_message`
/// event carries exactly this shape, so clients render history and live
/// messages with the same code path.
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub sender: SenderRef,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ChatHistoryResponse {
    pub messages: Vec<MessageResponse>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    sender_id: String,
    sender_name: String,
    message: String,
    created_at: String,
}

impl From<MessageRow> for MessageResponse {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            sender: SenderRef {
                id: row.sender_id,
                name: row.sender_name,
            },
            message: row.message,
            timestamp: row.created_at,
        }
    }
}

/// Persist step of the relay pipeline: insert the message with a server
/// timestamp and return the populated read model for broadcast. The caller
/// decides what to do on failure (the websocket path logs and drops).
pub async fn record_message(
    pool: &sqlx::SqlitePool,
    project_id: &str,
    sender_id: &str,
    sender_name: &str,
    message: &str,
) -> Result<MessageResponse> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO messages (id, project_id, sender_id, message, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(project_id)
    .bind(sender_id)
    .bind(message)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(MessageResponse {
        id,
        sender: SenderRef {
            id: sender_id.to_string(),
            name: sender_name.to_string(),
        },
        message: message.to_string(),
        timestamp: now,
    })
}

async fn chat_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<ChatHistoryResponse>> {
    require_member(&state.db.pool, &project_id, &user.id).await?;

    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT m.id, m.sender_id, u.name AS sender_name, m.message, m.created_at
        FROM messages m
        JOIN users u ON m.sender_id = u.id
        WHERE m.project_id = ?
        ORDER BY m.created_at ASC
        "#,
    )
    .bind(&project_id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(ChatHistoryResponse {
        messages: rows.into_iter().map(MessageResponse::from).collect(),
    }))
}
