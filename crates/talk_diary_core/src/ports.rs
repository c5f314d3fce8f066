//! crates/talk_diary_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! The hosted backend is reached only through [`BackendService`], which has a
//! pull side (queries and inserts) and a push side (a stream of row changes).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{Chat, ChatSummary, Message, MessageWithSender, Profile};
use crate::identifier::Identifier;
use crate::report::ReportRecord;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Change Feed Types
//=========================================================================================

/// Tables the backend publishes changes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    Chats,
    ChatMembers,
    Messages,
    Reports,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Chats => "chats",
            Table::ChatMembers => "chat_members",
            Table::Messages => "messages",
            Table::Reports => "reports",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profiles" => Ok(Table::Profiles),
            "chats" => Ok(Table::Chats),
            "chat_members" => Ok(Table::ChatMembers),
            "messages" => Ok(Table::Messages),
            "reports" => Ok(Table::Reports),
            other => Err(PortError::Unexpected(format!("unknown table '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl FromStr for ChangeKind {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(PortError::Unexpected(format!("unknown change kind '{}'", other))),
        }
    }
}

/// One row change pushed by the backend. `record` holds the columns the
/// backend chose to publish for that table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: Value,
}

impl ChangeEvent {
    /// Reads a column of the published row as a UUID.
    pub fn uuid(&self, column: &str) -> Option<Uuid> {
        self.record.get(column)?.as_str()?.parse().ok()
    }
}

/// Selects which change events a subscriber receives: one table, optionally
/// one kind of change, optionally a `column = value` predicate on the row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub table: Table,
    pub kind: Option<ChangeKind>,
    pub column_eq: Option<(String, String)>,
}

impl ChangeFilter {
    pub fn on(table: Table) -> Self {
        Self {
            table,
            kind: None,
            column_eq: None,
        }
    }

    pub fn kind(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.column_eq = Some((column.into(), value.to_string()));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != event.kind) {
            return false;
        }
        match &self.column_eq {
            None => true,
            Some((column, expected)) => match event.record.get(column) {
                Some(Value::String(s)) => s == expected,
                Some(Value::Number(n)) => n.to_string() == *expected,
                Some(Value::Bool(b)) => b.to_string() == *expected,
                _ => false,
            },
        }
    }
}

/// The push side of the backend: an unbounded stream of matching changes.
pub type ChangeStream = Pin<Box<dyn Stream<Item = PortResult<ChangeEvent>> + Send>>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait BackendService: Send + Sync {
    // --- Profiles ---
    async fn find_profile(&self, identifier: &Identifier) -> PortResult<Profile>;

    async fn create_profile(&self, identifier: &Identifier) -> PortResult<Profile>;

    async fn get_profile(&self, profile_id: Uuid) -> PortResult<Profile>;

    // --- Auth Sessions ---
    async fn create_auth_session(
        &self,
        session_id: &str,
        profile_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Chats ---
    async fn list_member_chats(&self, profile_id: Uuid) -> PortResult<Vec<ChatSummary>>;

    async fn list_public_chats(&self, profile_id: Uuid) -> PortResult<Vec<ChatSummary>>;

    /// Creates a chat and makes `creator_id` its first member.
    async fn create_chat(&self, name: &str, creator_id: Uuid) -> PortResult<Chat>;

    /// Joins a chat. Joining a chat twice is not an error.
    async fn join_chat(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<()>;

    async fn is_member(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<bool>;

    async fn member_count(&self, chat_id: Uuid) -> PortResult<u64>;

    // --- Messages ---
    /// Messages of a chat, oldest first.
    async fn list_messages(&self, chat_id: Uuid) -> PortResult<Vec<MessageWithSender>>;

    async fn get_message(&self, message_id: Uuid) -> PortResult<MessageWithSender>;

    async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> PortResult<Message>;

    /// Records that `profile_id` has read everything in the chat up to now.
    async fn mark_read(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<()>;

    // --- Reports ---
    async fn list_reports(&self, profile_id: Uuid) -> PortResult<Vec<ReportRecord>>;

    // --- Change Feed ---
    async fn subscribe(&self, filter: ChangeFilter) -> PortResult<ChangeStream>;
}
