//! Registration, login and refresh-with-rotation
//!
//! The first user ever registered becomes `super_admin` with no tenant;
//! every later registration creates a personal tenant and makes the user
//! its `tenant_admin`. Refresh tokens are single-use: a successful refresh
//! blacklists the presented token for its residual lifetime.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::auth::password;
use crate::auth::token::{self, TokenType};
use crate::error::{validation_error, ApiError};
use crate::models::{
    AuthResponse, LoginRequest, RefreshRequest, RefreshResponse, RegisterRequest, User,
};
use crate::ApiState;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

fn parse_body<T>(body: JsonBody<T>) -> Result<T, ApiError> {
    body.map(|Json(inner)| inner)
        .map_err(|_| ApiError::BadRequest("Invalid request body".into()))
}

fn issue_pair(
    state: &ApiState,
    user_id: &str,
    tenant_id: &str,
    email: &str,
    role: &str,
    permissions: &[String],
) -> Result<(String, String), ApiError> {
    let access = state
        .tokens
        .issue(
            TokenType::Access,
            user_id,
            tenant_id,
            email,
            role,
            permissions.to_vec(),
        )
        .map_err(|err| ApiError::Internal(format!("token issue failed: {err}")))?;
    let refresh = state
        .tokens
        .issue(
            TokenType::Refresh,
            user_id,
            tenant_id,
            email,
            role,
            permissions.to_vec(),
        )
        .map_err(|err| ApiError::Internal(format!("token issue failed: {err}")))?;
    Ok((access, refresh))
}

/// Create a user account and issue the first token pair.
#[utoipa::path(
    post,
    path = "/api/auth/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AuthResponse),
        (status = 400, description = "Invalid email or weak password"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn register(
    State(state): State<ApiState>,
    body: JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let email = req.email.trim().to_lowercase();
    if !password::is_valid_email(&email) {
        return Err(ApiError::BadRequest("Invalid email format".into()));
    }
    password::validate_password(&req.password).map_err(ApiError::BadRequest)?;

    let mut tx = state.db.auth.begin().await?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
        .bind(&email)
        .fetch_one(&mut *tx)
        .await?;
    if exists {
        return Err(ApiError::Conflict("Email already registered".into()));
    }

    let password_hash = password::hash_async(req.password).await?;

    // The very first account bootstraps the platform operator; everyone
    // after that gets a personal tenant they administer.
    let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&mut *tx)
        .await?;

    let (role, tenant_id) = if user_count == 0 {
        ("super_admin", None)
    } else {
        let tenant_id = Uuid::new_v4();
        let slug = format!("tenant_{}", &tenant_id.to_string()[..8]);
        sqlx::query(
            "INSERT INTO tenants (tenant_id, name, slug, status) VALUES ($1, $2, $3, 'active')",
        )
        .bind(tenant_id)
        .bind(&email)
        .bind(&slug)
        .execute(&mut *tx)
        .await?;
        ("tenant_admin", Some(tenant_id))
    };

    let user_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO users (user_id, tenant_id, email, password_hash, role, status, email_verified)
        VALUES ($1, $2, $3, $4, $5, 'active', true)
        "#,
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(&email)
    .bind(&password_hash)
    .bind(role)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let permissions = state.db.permissions_for_role(role).await?;
    let tenant_str = tenant_id.map(|t| t.to_string()).unwrap_or_default();
    let (access_token, refresh_token) = issue_pair(
        &state,
        &user_id.to_string(),
        &tenant_str,
        &email,
        role,
        &permissions,
    )?;

    state
        .notifier
        .user_registered(user_id, tenant_id, &email, role);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token,
            refresh_token,
            expires_in: state.tokens.access_ttl_secs(),
            user: User {
                user_id,
                tenant_id,
                email,
                password_hash: String::new(),
                role: role.to_string(),
                status: "active".to_string(),
                created_at: Some(Utc::now()),
                last_login_at: None,
            },
        }),
    ))
}

/// Authenticate with email and password.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token pair issued", body = AuthResponse),
        (status = 401, description = "Unknown email or wrong password"),
        (status = 403, description = "Account is not active")
    )
)]
pub async fn login(
    State(state): State<ApiState>,
    body: JsonBody<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let email = req.email.trim().to_lowercase();

    let user: Option<User> = sqlx::query_as(
        r#"
        SELECT user_id, tenant_id, email, password_hash, role, status, created_at, last_login_at
        FROM users
        WHERE email = $1
        "#,
    )
    .bind(&email)
    .fetch_optional(&state.db.auth)
    .await?;

    // Unknown email and wrong password produce the same answer.
    let Some(user) = user else {
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    };

    if user.status != "active" {
        return Err(ApiError::Forbidden("Account is not active".into()));
    }

    if !password::verify_async(req.password, user.password_hash.clone()).await? {
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    }

    let permissions = state.db.permissions_for_role(&user.role).await?;
    let tenant_str = user.tenant_id.map(|t| t.to_string()).unwrap_or_default();
    let (access_token, refresh_token) = issue_pair(
        &state,
        &user.user_id.to_string(),
        &tenant_str,
        &user.email,
        &user.role,
        &permissions,
    )?;

    let stamp = sqlx::query("UPDATE users SET last_login_at = NOW() WHERE user_id = $1")
        .bind(user.user_id)
        .execute(&state.db.auth)
        .await;
    if let Err(err) = stamp {
        tracing::warn!(error = %err, "last_login_at update failed");
    }

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        expires_in: state.tokens.access_ttl_secs(),
        user: User {
            password_hash: String::new(),
            ..user
        },
    }))
}

/// Rotate a refresh token: issue a new pair and revoke the presented one.
#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    tag = "auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair issued", body = RefreshResponse),
        (status = 401, description = "Invalid, expired or already-used refresh token"),
        (status = 403, description = "Account is not active")
    )
)]
pub async fn refresh(
    State(state): State<ApiState>,
    body: JsonBody<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let claims = state
        .tokens
        .verify(&req.refresh_token)
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".into()))?;
    if claims.token_type != TokenType::Refresh {
        return Err(ApiError::Unauthorized("Invalid refresh token".into()));
    }

    // Replay detection: an already-rotated token is on the blacklist.
    if let Some(cache) = &state.cache {
        match token::is_revoked(cache, &claims.jti).await {
            Ok(true) => {
                return Err(ApiError::Unauthorized(
                    "Refresh token already used".into(),
                ))
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "token blacklist check failed"),
        }
    }

    let user_id: Uuid = claims
        .user_id
        .parse()
        .map_err(|_| ApiError::Unauthorized("User not found".into()))?;

    let row: Option<(String, String, Option<Uuid>, String)> =
        sqlx::query_as("SELECT status, role, tenant_id, email FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&state.db.auth)
            .await?;
    let Some((status, role, tenant_id, email)) = row else {
        return Err(ApiError::Unauthorized("User not found".into()));
    };
    if status != "active" {
        return Err(ApiError::Forbidden("Account is not active".into()));
    }

    // Permissions are re-derived from the current role, not the old claims.
    let permissions = state.db.permissions_for_role(&role).await?;
    let tenant_str = tenant_id.map(|t| t.to_string()).unwrap_or_default();
    let (access_token, refresh_token) = issue_pair(
        &state,
        &claims.user_id,
        &tenant_str,
        &email,
        &role,
        &permissions,
    )?;

    if let Some(cache) = &state.cache {
        let residual = claims.exp - Utc::now().timestamp();
        if let Err(err) = token::revoke(cache, &claims.jti, residual).await {
            tracing::warn!(error = %err, "refresh token blacklist write failed");
        }
    }

    Ok(Json(RefreshResponse {
        access_token,
        refresh_token,
        expires_in: state.tokens.access_ttl_secs(),
    }))
}
