use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::models::{Task, TaskStatus},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    routes::projects::{require_member, UserRef},
    AppState,
};

pub fn router() -> Router<AppState> {
    // GET takes a project id, PUT/DELETE take a task id (mirrors the
    // client's /api/tasks/:projectId and /api/tasks/:id usage)
    Router::new()
        .route("/", post(create_task))
        .route(
            "/:id",
            get(list_tasks).put(update_task).delete(delete_task),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub due_date: Option<String>,
}

/// Partial update: absent fields keep their stored value; an explicit
/// `null` clears the assignee or due date.
#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub assigned_to: Option<Option<String>>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub due_date: Option<Option<String>>,
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`).
fn present_or_null<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_to: Option<UserRef>,
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
}

#[derive(Debug, Serialize)]
pub struct DeleteTaskResponse {
    pub id: String,
}

/// Task row with its assignee expanded in one query.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project_id: String,
    title: String,
    description: String,
    status: TaskStatus,
    assigned_to: Option<String>,
    due_date: Option<String>,
    created_at: String,
    updated_at: String,
    assignee_name: Option<String>,
    assignee_email: Option<String>,
}

impl From<TaskRow> for TaskResponse {
    fn from(row: TaskRow) -> Self {
        let assigned_to = match (row.assigned_to, row.assignee_name, row.assignee_email) {
            (Some(id), Some(name), Some(email)) => Some(UserRef { id, name, email }),
            _ => None,
        };

        Self {
            id: row.id,
            project_id: row.project_id,
            title: row.title,
            description: row.description,
            status: row.status,
            assigned_to,
            due_date: row.due_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const TASK_SELECT: &str = r#"
    SELECT t.id, t.project_id, t.title, t.description, t.status,
           t.assigned_to, t.due_date, t.created_at, t.updated_at,
           u.name AS assignee_name, u.email AS assignee_email
    FROM tasks t
    LEFT JOIN users u ON t.assigned_to = u.id
"#;

async fn fetch_task_expanded(pool: &sqlx::SqlitePool, id: &str) -> Result<TaskResponse> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE t.id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Task not found".to_string()))?;

    Ok(row.into())
}

async fn list_tasks(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<TaskListResponse>> {
    require_member(&state.db.pool, &project_id, &user.id).await?;

    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        "{TASK_SELECT} WHERE t.project_id = ? ORDER BY t.created_at ASC"
    ))
    .bind(&project_id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(TaskListResponse {
        tasks: rows.into_iter().map(TaskResponse::from).collect(),
    }))
}

async fn create_task(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Json<TaskResponse>> {
    require_member(&state.db.pool, &body.project_id, &user.id).await?;

    if body.title.trim().is_empty() {
        return Err(AppError::Validation("Task title is required".to_string()));
    }

    let task_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO tasks (id, project_id, title, description, status, assigned_to, due_date, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task_id)
    .bind(&body.project_id)
    .bind(&body.title)
    .bind(&body.description)
    .bind(body.status)
    .bind(&body.assigned_to)
    .bind(&body.due_date)
    .bind(&now)
    .bind(&now)
    .execute(&state.db.pool)
    .await?;

    Ok(Json(fetch_task_expanded(&state.db.pool, &task_id).await?))
}

async fn update_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateTaskRequest>,
) -> Result<Json<TaskResponse>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Task not found".to_string()))?;

    require_member(&state.db.pool, &task.project_id, &user.id).await?;

    // Last write wins; concurrent edits of the same task overwrite silently
    let title = body.title.unwrap_or(task.title);
    let description = body.description.unwrap_or(task.description);
    let status = body.status.unwrap_or(task.status);
    let assigned_to = body.assigned_to.unwrap_or(task.assigned_to);
    let due_date = body.due_date.unwrap_or(task.due_date);

    if title.trim().is_empty() {
        return Err(AppError::Validation("Task title is required".to_string()));
    }

    sqlx::query(
        r#"
        UPDATE tasks
        SET title = ?, description = ?, status = ?, assigned_to = ?, due_date = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&title)
    .bind(&description)
    .bind(status)
    .bind(&assigned_to)
    .bind(&due_date)
    .bind(Utc::now().to_rfc3339())
    .bind(&id)
    .execute(&state.db.pool)
    .await?;

    Ok(Json(fetch_task_expanded(&state.db.pool, &id).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<DeleteTaskResponse>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Task not found".to_string()))?;

    require_member(&state.db.pool, &task.project_id, &user.id).await?;

    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(&id)
        .execute(&state.db.pool)
        .await?;

    Ok(Json(DeleteTaskResponse { id }))
}
