//! crates/talk_diary_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These mirror the rows the hosted backend stores, minus any storage details.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::identifier::Identifier;

/// A user profile, looked up or created from a login identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// The identifier this profile was registered under.
    pub fn identifier(&self) -> Identifier {
        Identifier::from_normalized(self.name.clone(), self.tag.clone())
    }
}

/// A chat room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message joined with its sender's profile. The sender is `None` when the
/// profile row no longer exists.
#[derive(Debug, Clone)]
pub struct MessageWithSender {
    pub message: Message,
    pub sender: Option<Profile>,
}

/// A chat as it appears in either chat list, with the counters the list shows.
#[derive(Debug, Clone)]
pub struct ChatSummary {
    pub chat: Chat,
    pub member_count: u64,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u64,
    pub is_member: bool,
}
