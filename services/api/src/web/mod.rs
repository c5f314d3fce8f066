pub mod auth;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

pub use middleware::require_auth;
pub use ws_handler::ws_handler;

use crate::error::ApiError;
use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use state::AppState;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Builds the API router: public auth routes, and everything else behind the
/// session cookie check.
pub fn router(app_state: Arc<AppState>) -> Result<Router, ApiError> {
    let origin = app_state
        .config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid CORS_ORIGIN: {}", e)))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/me", get(auth::me_handler))
        .route(
            "/chats",
            get(rest::list_my_chats_handler).post(rest::create_chat_handler),
        )
        .route("/chats/public", get(rest::list_public_chats_handler))
        .route("/chats/{chat_id}/join", post(rest::join_chat_handler))
        .route(
            "/chats/{chat_id}/messages",
            get(rest::list_messages_handler).post(rest::send_message_handler),
        )
        .route("/chats/{chat_id}/read", post(rest::mark_read_handler))
        .route("/reports", get(rest::list_reports_handler))
        .route("/diary", get(rest::diary_handler))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    Ok(Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .with_state(app_state))
}
