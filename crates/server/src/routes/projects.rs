use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::models::{Invitation, Project},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    AppState,
};

/// Invitations are valid for 24 hours from issuance.
const INVITE_TTL_HOURS: i64 = 24;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route("/:id", get(get_project))
        .route("/:id/invite", post(invite))
        .route("/join/:token", post(join_project))
}

/// Display-ready projection of a user, used wherever a stored reference
/// (owner, member, assignee, sender) is expanded for the client.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRef {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Project> for ProjectResponse {
    fn from(p: Project) -> Self {
        Self {
            id: p.id,
            name: p.name,
            owner_id: p.owner_id,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProjectListResponse {
    pub projects: Vec<ProjectResponse>,
}

#[derive(Debug, Serialize)]
pub struct ProjectDetailResponse {
    pub id: String,
    pub name: String,
    pub owner: UserRef,
    pub members: Vec<UserRef>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct InviteResponse {
    pub invite_token: String,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub message: String,
    pub project_id: String,
}

/// Loads a project and verifies the caller is a member. Existence is
/// checked before authorization, so a missing project is always NotFound
/// and a real-but-foreign project is always Unauthorized.
pub(crate) async fn require_member(
    pool: &sqlx::SqlitePool,
    project_id: &str,
    user_id: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))?;

    let is_member = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM project_members WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    if is_member == 0 {
        return Err(AppError::Unauthorized("Not authorized".to_string()));
    }

    Ok(project)
}

async fn list_projects(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ProjectListResponse>> {
    let projects = sqlx::query_as::<_, Project>(
        r#"
        SELECT p.*
        FROM projects p
        JOIN project_members pm ON p.id = pm.project_id
        WHERE pm.user_id = ?
        ORDER BY p.updated_at DESC
        "#,
    )
    .bind(&user.id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(ProjectListResponse {
        projects: projects.into_iter().map(ProjectResponse::from).collect(),
    }))
}

async fn create_project(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateProjectRequest>,
) -> Result<Json<ProjectResponse>> {
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("Project name is required".to_string()));
    }

    let project_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO projects (id, name, owner_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&project_id)
    .bind(&body.name)
    .bind(&user.id)
    .bind(&now)
    .bind(&now)
    .execute(&state.db.pool)
    .await?;

    // The owner is always a member
    sqlx::query("INSERT INTO project_members (project_id, user_id) VALUES (?, ?)")
        .bind(&project_id)
        .bind(&user.id)
        .execute(&state.db.pool)
        .await?;

    Ok(Json(ProjectResponse {
        id: project_id,
        name: body.name,
        owner_id: user.id,
        created_at: now.clone(),
        updated_at: now,
    }))
}

async fn get_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ProjectDetailResponse>> {
    let project = require_member(&state.db.pool, &id, &user.id).await?;

    let owner = sqlx::query_as::<_, UserRef>("SELECT id, name, email FROM users WHERE id = ?")
        .bind(&project.owner_id)
        .fetch_one(&state.db.pool)
        .await?;

    let members = sqlx::query_as::<_, UserRef>(
        r#"
        SELECT u.id, u.name, u.email
        FROM project_members pm
        JOIN users u ON pm.user_id = u.id
        WHERE pm.project_id = ?
        ORDER BY u.name ASC
        "#,
    )
    .bind(&id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(ProjectDetailResponse {
        id: project.id,
        name: project.name,
        owner,
        members,
        created_at: project.created_at,
        updated_at: project.updated_at,
    }))
}

async fn invite(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<InviteResponse>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))?;

    if project.owner_id != user.id {
        return Err(AppError::Unauthorized("Only owner can invite".to_string()));
    }

    // 20 random bytes, hex-encoded
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    let invite_token = hex::encode(bytes);

    let now = Utc::now();
    let expires_at = now + Duration::hours(INVITE_TTL_HOURS);

    sqlx::query(
        "INSERT INTO invitations (id, project_id, invite_token, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&id)
    .bind(&invite_token)
    .bind(expires_at.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&state.db.pool)
    .await?;

    Ok(Json(InviteResponse { invite_token }))
}

async fn join_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(token): Path<String>,
) -> Result<Json<JoinResponse>> {
    // Invitations are consumed by expiry, not deletion; redeeming an
    // unexpired token any number of times is fine.
    let invitation = sqlx::query_as::<_, Invitation>(
        "SELECT * FROM invitations WHERE invite_token = ? AND expires_at > ?",
    )
    .bind(&token)
    .bind(Utc::now().to_rfc3339())
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::InvalidToken("Invalid or expired invite token".to_string()))?;

    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(&invitation.project_id)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))?;

    // Idempotent: joining twice is a no-op success
    let already_member = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM project_members WHERE project_id = ? AND user_id = ?",
    )
    .bind(&project.id)
    .bind(&user.id)
    .fetch_one(&state.db.pool)
    .await?;

    if already_member > 0 {
        return Ok(Json(JoinResponse {
            message: "Already a member".to_string(),
            project_id: project.id,
        }));
    }

    sqlx::query("INSERT INTO project_members (project_id, user_id) VALUES (?, ?)")
        .bind(&project.id)
        .bind(&user.id)
        .execute(&state.db.pool)
        .await?;

    Ok(Json(JoinResponse {
        message: "Joined project successfully".to_string(),
        project_id: project.id,
    }))
}
