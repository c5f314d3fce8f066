//! services/api/src/web/auth.rs
//!
//! Authentication endpoints. Users log in with a `name.tag` identifier; the
//! first login under an identifier creates its profile.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use talk_diary_core::domain::Profile;
use talk_diary_core::identifier::Identifier;
use talk_diary_core::ports::{BackendService, PortError, PortResult};
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::web::middleware::{session_id_from_headers, SESSION_COOKIE};
use crate::web::rest::port_error;
use crate::web::state::AppState;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    /// Raw `name.tag` as typed, e.g. `liam.gg`.
    pub identifier: String,
}

#[derive(Serialize, Debug, ToSchema)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub name: String,
    pub tag: String,
    /// The normalized `Name.tag` form.
    pub identifier: String,
    pub created_at: DateTime<Utc>,
}

impl From<Profile> for ProfileResponse {
    fn from(profile: Profile) -> Self {
        Self {
            identifier: profile.identifier().to_string(),
            id: profile.id,
            name: profile.name,
            tag: profile.tag,
            created_at: profile.created_at,
        }
    }
}

//=========================================================================================
// Login Flow
//=========================================================================================

/// Finds the profile registered under `identifier`, creating it on first use.
/// Returns the profile and whether it was just created.
pub async fn login_or_register(
    backend: &dyn BackendService,
    identifier: &Identifier,
) -> PortResult<(Profile, bool)> {
    match backend.find_profile(identifier).await {
        Ok(profile) => Ok((profile, false)),
        Err(PortError::NotFound(_)) => match backend.create_profile(identifier).await {
            Ok(profile) => Ok((profile, true)),
            // Another login registered the same identifier in between.
            Err(PortError::Conflict(_)) => Ok((backend.find_profile(identifier).await?, false)),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}

fn session_cookie(session_id: &str, ttl: Duration) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE,
        session_id,
        ttl.num_seconds()
    )
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/login - Log in with a `name.tag` identifier
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in to an existing profile", body = ProfileResponse),
        (status = 201, description = "Profile created on first login", body = ProfileResponse),
        (status = 400, description = "Malformed identifier"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let identifier = Identifier::parse(&req.identifier).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Invalid identifier (e.g. liam.gg): {}", e),
        )
    })?;

    let (profile, created) = login_or_register(state.backend.as_ref(), &identifier)
        .await
        .map_err(|e| port_error("Failed to log in", e))?;
    if created {
        info!(profile_id = %profile.id, %identifier, "Registered new profile");
    }

    let auth_session_id = Uuid::new_v4().to_string();
    let ttl = Duration::days(state.config.session_ttl_days);
    state
        .backend
        .create_auth_session(&auth_session_id, profile.id, Utc::now() + ttl)
        .await
        .map_err(|e| {
            error!("Failed to create auth session: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session".to_string())
        })?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        [(header::SET_COOKIE, session_cookie(&auth_session_id, ttl))],
        Json(ProfileResponse::from(profile)),
    ))
}

/// POST /auth/logout - Logout and invalidate session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "No active session")
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let auth_session_id = session_id_from_headers(&headers)
        .ok_or((StatusCode::UNAUTHORIZED, "No session found".to_string()))?;

    state
        .backend
        .delete_auth_session(auth_session_id)
        .await
        .map_err(|e| {
            error!("Failed to delete auth session: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to logout".to_string())
        })?;

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie("", Duration::zero()))],
    ))
}

/// GET /me - The profile of the logged-in user
#[utoipa::path(
    get,
    path = "/me",
    responses(
        (status = 200, description = "Current profile", body = ProfileResponse),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let profile = state
        .backend
        .get_profile(profile_id)
        .await
        .map_err(|e| port_error("Failed to load profile", e))?;
    Ok(Json(ProfileResponse::from(profile)))
}
