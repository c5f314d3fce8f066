//! crates/talk_diary_core/src/chat.rs
//!
//! Helpers for the chat lists and the message composer.

use std::cmp::Ordering;

use crate::domain::ChatSummary;

/// Orders chats by their latest message, newest first. Chats without any
/// message go last, keeping their relative order.
pub fn sort_by_recent_activity(chats: &mut [ChatSummary]) {
    chats.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Sum of unread messages across the given chats.
pub fn total_unread(chats: &[ChatSummary]) -> u64 {
    chats.iter().map(|c| c.unread_count).sum()
}

/// Trims a message body. Whitespace-only messages are not sent.
pub fn normalize_message_content(content: &str) -> Option<&str> {
    non_empty_trimmed(content)
}

/// Trims a new chat's name. Whitespace-only names are rejected.
pub fn normalize_chat_name(name: &str) -> Option<&str> {
    non_empty_trimmed(name)
}

fn non_empty_trimmed(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
