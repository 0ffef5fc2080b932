use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::State, routing::post, Json, Router};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::models::User,
    error::{AppError, Result},
    AppState,
};

/// Bearer tokens outlive invite tokens by design: a session lasts a week,
/// an invitation a day.
const TOKEN_TTL_DAYS: i64 = 7;
const MIN_PASSWORD_LEN: usize = 8;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub email: String,
    pub name: String,
    pub exp: usize,
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| AppError::Internal("Failed to hash password".to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

fn issue_token(user_id: &str, email: &str, name: &str, secret: &str) -> Result<String> {
    let expires = Utc::now() + Duration::days(TOKEN_TTL_DAYS);

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        name: name.to_string(),
        exp: expires.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AppError::Internal("Failed to create token".to_string()))
}

fn validate_registration(body: &RegisterRequest) -> Result<()> {
    if body.email.is_empty() || !body.email.contains('@') {
        return Err(AppError::Validation("Invalid email address".to_string()));
    }
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("Name is required".to_string()));
    }
    if body.password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>> {
    validate_registration(&body)?;

    let taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(&body.email)
        .fetch_one(&state.db.pool)
        .await?;

    if taken > 0 {
        return Err(AppError::Validation("Email already registered".to_string()));
    }

    let user = User {
        id: Uuid::new_v4().to_string(),
        email: body.email,
        name: body.name,
        password_hash: hash_password(&body.password)?,
        created_at: Utc::now().to_rfc3339(),
    };

    sqlx::query(
        "INSERT INTO users (id, email, name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&user.name)
    .bind(&user.password_hash)
    .bind(&user.created_at)
    .execute(&state.db.pool)
    .await?;

    let token = issue_token(&user.id, &user.email, &user.name, &state.config.jwt_secret)?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(&body.email)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid credentials".to_string()))?;

    if !verify_password(&body.password, &user.password_hash)? {
        return Err(AppError::Unauthorized("Invalid credentials".to_string()));
    }

    let token = issue_token(&user.id, &user.email, &user.name, &state.config.jwt_secret)?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::decode_claims;

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse battery").unwrap();
        assert_ne!(hash, "correct horse battery");
        assert!(verify_password("correct horse battery", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn issued_tokens_decode_with_the_same_secret_only() {
        let token = issue_token("u1", "u1@example.com", "U One", "secret").unwrap();

        let claims = decode_claims(&token, "secret").unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.email, "u1@example.com");
        assert_eq!(claims.name, "U One");
        assert!(claims.exp > Utc::now().timestamp() as usize);

        assert!(decode_claims(&token, "other-secret").is_err());
        assert!(decode_claims("garbage", "secret").is_err());
    }

    #[test]
    fn registration_validation() {
        let ok = RegisterRequest {
            email: "a@example.com".to_string(),
            name: "A".to_string(),
            password: "password123".to_string(),
        };
        assert!(validate_registration(&ok).is_ok());

        let bad_email = RegisterRequest {
            email: "nope".to_string(),
            ..registration("A", "password123")
        };
        assert!(validate_registration(&bad_email).is_err());

        let blank_name = registration("   ", "password123");
        assert!(validate_registration(&blank_name).is_err());

        let short_password = registration("A", "short");
        assert!(validate_registration(&short_password).is_err());
    }

    fn registration(name: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            email: "a@example.com".to_string(),
            name: name.to_string(),
            password: password.to_string(),
        }
    }
}
