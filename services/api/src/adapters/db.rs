//! services/api/src/adapters/db.rs
//!
//! This module contains the backend adapter, which is the concrete implementation
//! of the `BackendService` port from the `core` crate. The hosted backend is a
//! Postgres database, so every query goes through a `sqlx` pool. Change
//! subscriptions are served from the shared [`ChangeFeed`] and never take a
//! pool connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use talk_diary_core::domain::{Chat, ChatSummary, Message, MessageWithSender, Profile};
use talk_diary_core::identifier::Identifier;
use talk_diary_core::ports::{
    BackendService, ChangeFilter, ChangeStream, PortError, PortResult,
};
use talk_diary_core::report::ReportRecord;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::change_feed::ChangeFeed;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A backend adapter that implements the `BackendService` port.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    changes: ChangeFeed,
}

impl PgBackend {
    /// Creates a new `PgBackend`.
    pub fn new(pool: PgPool, changes: ChangeFeed) -> Self {
        Self { pool, changes }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct ProfileRecord {
    id: Uuid,
    name: String,
    tag: String,
    created_at: DateTime<Utc>,
}
impl ProfileRecord {
    fn to_domain(self) -> Profile {
        Profile {
            id: self.id,
            name: self.name,
            tag: self.tag,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct ChatRecord {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}
impl ChatRecord {
    fn to_domain(self) -> Chat {
        Chat {
            id: self.id,
            name: self.name,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct ChatSummaryRecord {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    member_count: i64,
    last_message: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
    unread_count: i64,
    is_member: bool,
}
impl ChatSummaryRecord {
    fn to_domain(self) -> ChatSummary {
        ChatSummary {
            chat: Chat {
                id: self.id,
                name: self.name,
                created_at: self.created_at,
            },
            member_count: self.member_count.max(0) as u64,
            last_message: self.last_message,
            last_message_at: self.last_message_at,
            unread_count: self.unread_count.max(0) as u64,
            is_member: self.is_member,
        }
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
}
impl MessageRecord {
    fn to_domain(self) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct MessageWithSenderRecord {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    sender_name: Option<String>,
    sender_tag: Option<String>,
    sender_created_at: Option<DateTime<Utc>>,
}
impl MessageWithSenderRecord {
    fn to_domain(self) -> MessageWithSender {
        let sender = match (self.sender_name, self.sender_tag, self.sender_created_at) {
            (Some(name), Some(tag), Some(created_at)) => Some(Profile {
                id: self.sender_id,
                name,
                tag,
                created_at,
            }),
            _ => None,
        };
        MessageWithSender {
            message: Message {
                id: self.id,
                chat_id: self.chat_id,
                sender_id: self.sender_id,
                content: self.content,
                created_at: self.created_at,
            },
            sender,
        }
    }
}

#[derive(FromRow)]
struct ReportRow {
    id: Uuid,
    user_id: Uuid,
    content: Value,
    created_at: DateTime<Utc>,
}
impl ReportRow {
    fn to_domain(self) -> ReportRecord {
        ReportRecord {
            id: self.id,
            profile_id: self.user_id,
            content: self.content,
            created_at: self.created_at,
        }
    }
}

//=========================================================================================
// Queries
//=========================================================================================

const MESSAGE_WITH_SENDER_SELECT: &str = "SELECT m.id, m.chat_id, m.sender_id, m.content, m.created_at, \
            p.name AS sender_name, p.tag AS sender_tag, p.created_at AS sender_created_at \
     FROM messages m LEFT JOIN profiles p ON p.id = m.sender_id";

//=========================================================================================
// Error Mapping
//=========================================================================================

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn db_error_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

//=========================================================================================
// `BackendService` Trait Implementation
//=========================================================================================

#[async_trait]
impl BackendService for PgBackend {
    async fn find_profile(&self, identifier: &Identifier) -> PortResult<Profile> {
        let record = sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, name, tag, created_at FROM profiles WHERE name = $1 AND tag = $2",
        )
        .bind(identifier.name())
        .bind(identifier.tag())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Profile {} not found", identifier)))?;
        Ok(record.to_domain())
    }

    async fn create_profile(&self, identifier: &Identifier) -> PortResult<Profile> {
        let record = sqlx::query_as::<_, ProfileRecord>(
            "INSERT INTO profiles (name, tag) VALUES ($1, $2) RETURNING id, name, tag, created_at",
        )
        .bind(identifier.name())
        .bind(identifier.tag())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match db_error_code(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => {
                PortError::Conflict(format!("Profile {} already exists", identifier))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_profile(&self, profile_id: Uuid) -> PortResult<Profile> {
        let record = sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, name, tag, created_at FROM profiles WHERE id = $1",
        )
        .bind(profile_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Profile {} not found", profile_id))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        profile_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, profile_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(profile_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        let profile_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT profile_id FROM auth_sessions WHERE id = $1 AND expires_at > now()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        profile_id.ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn list_member_chats(&self, profile_id: Uuid) -> PortResult<Vec<ChatSummary>> {
        let records = sqlx::query_as::<_, ChatSummaryRecord>(
            "SELECT c.id, c.name, c.created_at, \
                    (SELECT COUNT(*) FROM chat_members all_m WHERE all_m.chat_id = c.id) AS member_count, \
                    last_m.content AS last_message, \
                    last_m.created_at AS last_message_at, \
                    (SELECT COUNT(*) FROM messages unread_m \
                      WHERE unread_m.chat_id = c.id \
                        AND unread_m.created_at > COALESCE(cm.last_read_at, 'epoch'::timestamptz)) AS unread_count, \
                    TRUE AS is_member \
             FROM chat_members cm \
             JOIN chats c ON c.id = cm.chat_id \
             LEFT JOIN LATERAL ( \
                 SELECT content, created_at FROM messages \
                 WHERE chat_id = c.id ORDER BY created_at DESC LIMIT 1 \
             ) last_m ON TRUE \
             WHERE cm.user_id = $1",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn list_public_chats(&self, profile_id: Uuid) -> PortResult<Vec<ChatSummary>> {
        let records = sqlx::query_as::<_, ChatSummaryRecord>(
            "SELECT c.id, c.name, c.created_at, \
                    (SELECT COUNT(*) FROM chat_members all_m WHERE all_m.chat_id = c.id) AS member_count, \
                    NULL::text AS last_message, \
                    NULL::timestamptz AS last_message_at, \
                    0::bigint AS unread_count, \
                    EXISTS (SELECT 1 FROM chat_members me \
                             WHERE me.chat_id = c.id AND me.user_id = $1) AS is_member \
             FROM chats c \
             ORDER BY c.created_at DESC",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn create_chat(&self, name: &str, creator_id: Uuid) -> PortResult<Chat> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let chat = sqlx::query_as::<_, ChatRecord>(
            "INSERT INTO chats (name) VALUES ($1) RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES ($1, $2)")
            .bind(chat.id)
            .bind(creator_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(chat.to_domain())
    }

    async fn join_chat(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO chat_members (chat_id, user_id) VALUES ($1, $2) \
             ON CONFLICT (chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id)
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match db_error_code(&e).as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => PortError::NotFound(format!("Chat {} not found", chat_id)),
            _ => unexpected(e),
        })?;
        Ok(())
    }

    async fn is_member(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM chat_members WHERE chat_id = $1 AND user_id = $2)",
        )
        .bind(chat_id)
        .bind(profile_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn member_count(&self, chat_id: Uuid) -> PortResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_members WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(count.max(0) as u64)
    }

    async fn list_messages(&self, chat_id: Uuid) -> PortResult<Vec<MessageWithSender>> {
        let records = sqlx::query_as::<_, MessageWithSenderRecord>(&format!(
            "{} WHERE m.chat_id = $1 ORDER BY m.created_at ASC",
            MESSAGE_WITH_SENDER_SELECT
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn get_message(&self, message_id: Uuid) -> PortResult<MessageWithSender> {
        let record = sqlx::query_as::<_, MessageWithSenderRecord>(&format!(
            "{} WHERE m.id = $1",
            MESSAGE_WITH_SENDER_SELECT
        ))
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Message {} not found", message_id))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> PortResult<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(
            "INSERT INTO messages (chat_id, sender_id, content) VALUES ($1, $2, $3) \
             RETURNING id, chat_id, sender_id, content, created_at",
        )
        .bind(chat_id)
        .bind(sender_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match db_error_code(&e).as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => PortError::NotFound(format!("Chat {} not found", chat_id)),
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn mark_read(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE chat_members SET last_read_at = now() WHERE chat_id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!(
                "Profile {} is not a member of chat {}",
                profile_id, chat_id
            )));
        }
        Ok(())
    }

    async fn list_reports(&self, profile_id: Uuid) -> PortResult<Vec<ReportRecord>> {
        let rows = sqlx::query_as::<_, ReportRow>(
            "SELECT id, user_id, content, created_at FROM reports \
             WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(rows.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn subscribe(&self, filter: ChangeFilter) -> PortResult<ChangeStream> {
        debug!(table = %filter.table, "Subscribed to change feed");
        Ok(self.changes.subscribe(filter))
    }
}
