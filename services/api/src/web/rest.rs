//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the chat and diary REST endpoints and the
//! master definition for the OpenAPI specification.

use crate::web::auth::{self, LoginRequest, ProfileResponse};
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use talk_diary_core::chat::{
    normalize_chat_name, normalize_message_content, sort_by_recent_activity, total_unread,
};
use talk_diary_core::domain::{Chat, ChatSummary, Message, MessageWithSender};
use talk_diary_core::ports::PortError;
use talk_diary_core::report::{normalize_reports, DailyReport};
use talk_diary_core::DiaryIndex;
use tracing::{error, info};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::login_handler,
        auth::logout_handler,
        auth::me_handler,
        list_my_chats_handler,
        list_public_chats_handler,
        create_chat_handler,
        join_chat_handler,
        list_messages_handler,
        send_message_handler,
        mark_read_handler,
        list_reports_handler,
        diary_handler,
    ),
    components(
        schemas(
            LoginRequest,
            ProfileResponse,
            ChatResponse,
            ChatSummaryResponse,
            ChatListResponse,
            CreateChatRequest,
            MessageResponse,
            SenderResponse,
            ChatRoomResponse,
            SendMessageRequest,
            DiaryDayResponse,
        )
    ),
    tags(
        (name = "Talk Diary API", description = "Chat rooms, unread counts and the daily diary.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct ChatResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<Chat> for ChatResponse {
    fn from(chat: Chat) -> Self {
        Self {
            id: chat.id,
            name: chat.name,
            created_at: chat.created_at,
        }
    }
}

/// A row of either chat list.
#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct ChatSummaryResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub member_count: u64,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u64,
    pub is_member: bool,
}

impl From<ChatSummary> for ChatSummaryResponse {
    fn from(summary: ChatSummary) -> Self {
        Self {
            id: summary.chat.id,
            name: summary.chat.name,
            created_at: summary.chat.created_at,
            member_count: summary.member_count,
            last_message: summary.last_message,
            last_message_at: summary.last_message_at,
            unread_count: summary.unread_count,
            is_member: summary.is_member,
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
pub struct ChatListResponse {
    pub chats: Vec<ChatSummaryResponse>,
    pub total_unread: u64,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateChatRequest {
    pub name: String,
}

#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct SenderResponse {
    pub id: Uuid,
    pub name: String,
}

#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct MessageResponse {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender: Option<SenderResponse>,
}

impl From<MessageWithSender> for MessageResponse {
    fn from(m: MessageWithSender) -> Self {
        Self {
            sender: m.sender.map(|p| SenderResponse {
                id: p.id,
                name: p.name,
            }),
            ..Self::from(m.message)
        }
    }
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            chat_id: m.chat_id,
            sender_id: m.sender_id,
            content: m.content,
            created_at: m.created_at,
            sender: None,
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
pub struct ChatRoomResponse {
    pub chat_id: Uuid,
    pub member_count: u64,
    pub messages: Vec<MessageResponse>,
}

#[derive(Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Deserialize, IntoParams)]
pub struct DiaryQuery {
    /// First day of the range, inclusive (`YYYY-MM-DD`).
    pub from: NaiveDate,
    /// Last day of the range, inclusive (`YYYY-MM-DD`).
    pub to: NaiveDate,
}

#[derive(Serialize, Debug, ToSchema)]
pub struct DiaryDayResponse {
    pub date: NaiveDate,
    pub emotion: String,
}

/// The diary calendar for a date range: the dominant emotion of each day that
/// has a report, and the reports themselves.
#[derive(Serialize, Debug)]
pub struct DiaryResponse {
    pub emotions: Vec<DiaryDayResponse>,
    pub reports: Vec<DailyReport>,
}

//=========================================================================================
// Error Mapping
//=========================================================================================

type HandlerError = (StatusCode, String);

/// Maps a port error to an HTTP status, logging anything unexpected.
pub(crate) fn port_error(context: &str, e: PortError) -> HandlerError {
    match e {
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        PortError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        PortError::Unauthorized => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
        PortError::Unexpected(msg) => {
            error!("{}: {}", context, msg);
            (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
        }
    }
}

async fn require_membership(
    state: &AppState,
    chat_id: Uuid,
    profile_id: Uuid,
) -> Result<(), HandlerError> {
    let member = state
        .backend
        .is_member(chat_id, profile_id)
        .await
        .map_err(|e| port_error("Failed to check chat membership", e))?;
    if member {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            "Join the chat before reading or sending messages".to_string(),
        ))
    }
}

//=========================================================================================
// Chat Handlers
//=========================================================================================

/// List the chats the current user belongs to, most recently active first.
#[utoipa::path(
    get,
    path = "/chats",
    responses(
        (status = 200, description = "Member chats with unread counts", body = ChatListResponse),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn list_my_chats_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let mut chats = state
        .backend
        .list_member_chats(profile_id)
        .await
        .map_err(|e| port_error("Failed to list chats", e))?;
    sort_by_recent_activity(&mut chats);

    let response = ChatListResponse {
        total_unread: total_unread(&chats),
        chats: chats.into_iter().map(Into::into).collect(),
    };
    Ok(Json(response))
}

/// List every chat, newest first, flagging the ones the user has joined.
#[utoipa::path(
    get,
    path = "/chats/public",
    responses(
        (status = 200, description = "All chats", body = [ChatSummaryResponse]),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn list_public_chats_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let chats = state
        .backend
        .list_public_chats(profile_id)
        .await
        .map_err(|e| port_error("Failed to list public chats", e))?;
    let response: Vec<ChatSummaryResponse> = chats.into_iter().map(Into::into).collect();
    Ok(Json(response))
}

/// Create a chat. The creator becomes its first member.
#[utoipa::path(
    post,
    path = "/chats",
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created", body = ChatResponse),
        (status = 400, description = "Blank chat name"),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn create_chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
    Json(req): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let name = normalize_chat_name(&req.name)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Chat name must not be blank".to_string()))?;

    let chat = state
        .backend
        .create_chat(name, profile_id)
        .await
        .map_err(|e| port_error("Failed to create chat", e))?;
    info!(chat_id = %chat.id, %profile_id, "Chat created");

    Ok((StatusCode::CREATED, Json(ChatResponse::from(chat))))
}

/// Join a chat. Joining twice is a no-op.
#[utoipa::path(
    post,
    path = "/chats/{chat_id}/join",
    params(("chat_id" = Uuid, Path, description = "The chat to join.")),
    responses(
        (status = 204, description = "Joined"),
        (status = 404, description = "No such chat")
    )
)]
pub async fn join_chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
) -> Result<StatusCode, HandlerError> {
    state
        .backend
        .join_chat(chat_id, profile_id)
        .await
        .map_err(|e| port_error("Failed to join chat", e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Open a chat room: its messages oldest first. Opening a room marks it read.
#[utoipa::path(
    get,
    path = "/chats/{chat_id}/messages",
    params(("chat_id" = Uuid, Path, description = "The chat to open.")),
    responses(
        (status = 200, description = "Messages of the chat", body = ChatRoomResponse),
        (status = 403, description = "Not a member of the chat")
    )
)]
pub async fn list_messages_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    require_membership(&state, chat_id, profile_id).await?;

    let messages = state
        .backend
        .list_messages(chat_id)
        .await
        .map_err(|e| port_error("Failed to load messages", e))?;
    let member_count = state
        .backend
        .member_count(chat_id)
        .await
        .map_err(|e| port_error("Failed to count members", e))?;
    state
        .backend
        .mark_read(chat_id, profile_id)
        .await
        .map_err(|e| port_error("Failed to mark chat as read", e))?;

    Ok(Json(ChatRoomResponse {
        chat_id,
        member_count,
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

/// Send a message to a chat the user belongs to.
#[utoipa::path(
    post,
    path = "/chats/{chat_id}/messages",
    params(("chat_id" = Uuid, Path, description = "The chat to post in.")),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message stored", body = MessageResponse),
        (status = 400, description = "Blank message"),
        (status = 403, description = "Not a member of the chat")
    )
)]
pub async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let content = normalize_message_content(&req.content)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Message must not be blank".to_string()))?;
    require_membership(&state, chat_id, profile_id).await?;

    let message = state
        .backend
        .send_message(chat_id, profile_id, content)
        .await
        .map_err(|e| port_error("Failed to send message", e))?;

    Ok((StatusCode::CREATED, Json(MessageResponse::from(message))))
}

/// Mark everything in a chat as read for the current user.
#[utoipa::path(
    post,
    path = "/chats/{chat_id}/read",
    params(("chat_id" = Uuid, Path, description = "The chat to mark read.")),
    responses(
        (status = 204, description = "Marked read"),
        (status = 404, description = "Not a member of the chat")
    )
)]
pub async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
    Path(chat_id): Path<Uuid>,
) -> Result<StatusCode, HandlerError> {
    state
        .backend
        .mark_read(chat_id, profile_id)
        .await
        .map_err(|e| port_error("Failed to mark chat as read", e))?;
    Ok(StatusCode::NO_CONTENT)
}

//=========================================================================================
// Diary Handlers
//=========================================================================================

/// All displayable daily reports of the current user, in backend order.
/// Reports without a target date are left out.
#[utoipa::path(
    get,
    path = "/reports",
    responses(
        (status = 200, description = "Normalized daily reports"),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn list_reports_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let records = state
        .backend
        .list_reports(profile_id)
        .await
        .map_err(|e| port_error("Failed to load reports", e))?;
    Ok(Json(normalize_reports(&records)))
}

/// The diary calendar between two dates, inclusive.
#[utoipa::path(
    get,
    path = "/diary",
    params(DiaryQuery),
    responses(
        (status = 200, description = "Emotions per day and the reports in range"),
        (status = 400, description = "`from` is after `to`")
    )
)]
pub async fn diary_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
    Query(range): Query<DiaryQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    if range.from > range.to {
        return Err((
            StatusCode::BAD_REQUEST,
            "`from` must not be after `to`".to_string(),
        ));
    }

    let records = state
        .backend
        .list_reports(profile_id)
        .await
        .map_err(|e| port_error("Failed to load reports", e))?;
    let index = DiaryIndex::from_records(&records);

    let emotions = index
        .emotions_between(range.from, range.to)
        .into_iter()
        .map(|(date, emotion)| DiaryDayResponse {
            date,
            emotion: emotion.to_string(),
        })
        .collect();
    let reports = index
        .reports_between(range.from, range.to)
        .into_iter()
        .cloned()
        .collect();

    Ok(Json(DiaryResponse { emotions, reports }))
}
