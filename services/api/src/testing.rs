//! In-memory backend and app builders for handler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use talk_diary_core::domain::{Chat, ChatSummary, Message, MessageWithSender, Profile};
use talk_diary_core::identifier::Identifier;
use talk_diary_core::ports::{
    BackendService, ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, PortError, PortResult,
    Table,
};
use talk_diary_core::report::ReportRecord;
use uuid::Uuid;

use crate::adapters::change_feed::ChangeFeed;
use crate::config::Config;
use crate::web::state::AppState;

struct Membership {
    chat_id: Uuid,
    profile_id: Uuid,
    last_read_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FakeState {
    profiles: Vec<Profile>,
    sessions: HashMap<String, (Uuid, DateTime<Utc>)>,
    chats: Vec<Chat>,
    members: Vec<Membership>,
    messages: Vec<Message>,
    reports: Vec<ReportRecord>,
}

impl FakeState {
    fn is_member(&self, chat_id: Uuid, profile_id: Uuid) -> bool {
        self.members
            .iter()
            .any(|m| m.chat_id == chat_id && m.profile_id == profile_id)
    }

    fn summary(&self, chat: &Chat, profile_id: Uuid) -> ChatSummary {
        let membership = self
            .members
            .iter()
            .find(|m| m.chat_id == chat.id && m.profile_id == profile_id);
        let messages: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| m.chat_id == chat.id)
            .collect();
        let last = messages.iter().max_by_key(|m| m.created_at);
        let unread_count = match membership {
            Some(m) => messages
                .iter()
                .filter(|msg| m.last_read_at.map_or(true, |read| msg.created_at > read))
                .count() as u64,
            None => 0,
        };
        ChatSummary {
            chat: chat.clone(),
            member_count: self.members.iter().filter(|m| m.chat_id == chat.id).count() as u64,
            last_message: last.map(|m| m.content.clone()),
            last_message_at: last.map(|m| m.created_at),
            unread_count,
            is_member: membership.is_some(),
        }
    }

    fn with_sender(&self, message: &Message) -> MessageWithSender {
        MessageWithSender {
            message: message.clone(),
            sender: self
                .profiles
                .iter()
                .find(|p| p.id == message.sender_id)
                .cloned(),
        }
    }
}

/// A [`BackendService`] over plain vectors. Mutations publish the same
/// content-less row images the Postgres triggers do.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    miss_next_lookup: AtomicBool,
    changes: ChangeFeed,
}

impl FakeBackend {
    /// Makes the next `find_profile` report `NotFound`, as if another login
    /// registered the profile right after the lookup.
    pub fn hide_profiles_from_lookup_once(&self) {
        self.miss_next_lookup.store(true, Ordering::SeqCst);
    }

    pub fn add_report(&self, profile_id: Uuid, content: Value) -> Uuid {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        self.state.lock().unwrap().reports.push(ReportRecord {
            id,
            profile_id,
            content,
            created_at,
        });
        self.publish(
            Table::Reports,
            ChangeKind::Insert,
            json!({ "id": id, "user_id": profile_id, "created_at": created_at }),
        );
        id
    }

    fn publish(&self, table: Table, kind: ChangeKind, record: Value) {
        self.changes.publish(ChangeEvent {
            table,
            kind,
            record,
        });
    }
}

fn membership_row(membership: &Membership) -> Value {
    json!({
        "chat_id": membership.chat_id,
        "user_id": membership.profile_id,
        "last_read_at": membership.last_read_at,
    })
}

fn not_found(what: &str) -> PortError {
    PortError::NotFound(format!("{} not found", what))
}

#[async_trait]
impl BackendService for FakeBackend {
    async fn find_profile(&self, identifier: &Identifier) -> PortResult<Profile> {
        if self.miss_next_lookup.swap(false, Ordering::SeqCst) {
            return Err(not_found("profile"));
        }
        let state = self.state.lock().unwrap();
        state
            .profiles
            .iter()
            .find(|p| p.name == identifier.name() && p.tag == identifier.tag())
            .cloned()
            .ok_or_else(|| not_found("profile"))
    }

    async fn create_profile(&self, identifier: &Identifier) -> PortResult<Profile> {
        let mut state = self.state.lock().unwrap();
        if state
            .profiles
            .iter()
            .any(|p| p.name == identifier.name() && p.tag == identifier.tag())
        {
            return Err(PortError::Conflict(format!("{} is taken", identifier)));
        }
        let profile = Profile {
            id: Uuid::new_v4(),
            name: identifier.name().to_string(),
            tag: identifier.tag().to_string(),
            created_at: Utc::now(),
        };
        state.profiles.push(profile.clone());
        Ok(profile)
    }

    async fn get_profile(&self, profile_id: Uuid) -> PortResult<Profile> {
        let state = self.state.lock().unwrap();
        state
            .profiles
            .iter()
            .find(|p| p.id == profile_id)
            .cloned()
            .ok_or_else(|| not_found("profile"))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        profile_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .insert(session_id.to_string(), (profile_id, expires_at));
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        let state = self.state.lock().unwrap();
        match state.sessions.get(session_id) {
            Some((profile_id, expires_at)) if *expires_at > Utc::now() => Ok(*profile_id),
            _ => Err(PortError::Unauthorized),
        }
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.state.lock().unwrap().sessions.remove(session_id);
        Ok(())
    }

    async fn list_member_chats(&self, profile_id: Uuid) -> PortResult<Vec<ChatSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .chats
            .iter()
            .filter(|c| state.is_member(c.id, profile_id))
            .map(|c| state.summary(c, profile_id))
            .collect())
    }

    async fn list_public_chats(&self, profile_id: Uuid) -> PortResult<Vec<ChatSummary>> {
        let state = self.state.lock().unwrap();
        let mut chats: Vec<ChatSummary> = state
            .chats
            .iter()
            .map(|c| state.summary(c, profile_id))
            .collect();
        chats.sort_by(|a, b| b.chat.created_at.cmp(&a.chat.created_at));
        Ok(chats)
    }

    async fn create_chat(&self, name: &str, creator_id: Uuid) -> PortResult<Chat> {
        let chat = Chat {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        // The creator has read nothing yet, as with the Postgres insert.
        let membership = Membership {
            chat_id: chat.id,
            profile_id: creator_id,
            last_read_at: None,
        };
        let member_row = membership_row(&membership);
        {
            let mut state = self.state.lock().unwrap();
            state.chats.push(chat.clone());
            state.members.push(membership);
        }
        self.publish(
            Table::Chats,
            ChangeKind::Insert,
            json!({ "id": chat.id, "name": chat.name, "created_at": chat.created_at }),
        );
        self.publish(Table::ChatMembers, ChangeKind::Insert, member_row);
        Ok(chat)
    }

    async fn join_chat(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<()> {
        let joined = {
            let mut state = self.state.lock().unwrap();
            if !state.chats.iter().any(|c| c.id == chat_id) {
                return Err(not_found("chat"));
            }
            if state.is_member(chat_id, profile_id) {
                None
            } else {
                let membership = Membership {
                    chat_id,
                    profile_id,
                    last_read_at: None,
                };
                let row = membership_row(&membership);
                state.members.push(membership);
                Some(row)
            }
        };
        if let Some(row) = joined {
            self.publish(Table::ChatMembers, ChangeKind::Insert, row);
        }
        Ok(())
    }

    async fn is_member(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<bool> {
        Ok(self.state.lock().unwrap().is_member(chat_id, profile_id))
    }

    async fn member_count(&self, chat_id: Uuid) -> PortResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.members.iter().filter(|m| m.chat_id == chat_id).count() as u64)
    }

    async fn list_messages(&self, chat_id: Uuid) -> PortResult<Vec<MessageWithSender>> {
        let state = self.state.lock().unwrap();
        let mut messages: Vec<MessageWithSender> = state
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| state.with_sender(m))
            .collect();
        messages.sort_by_key(|m| m.message.created_at);
        Ok(messages)
    }

    async fn get_message(&self, message_id: Uuid) -> PortResult<MessageWithSender> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| state.with_sender(m))
            .ok_or_else(|| not_found("message"))
    }

    async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> PortResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().messages.push(message.clone());
        self.publish(
            Table::Messages,
            ChangeKind::Insert,
            json!({
                "id": message.id,
                "chat_id": message.chat_id,
                "sender_id": message.sender_id,
                "created_at": message.created_at,
            }),
        );
        Ok(message)
    }

    async fn mark_read(&self, chat_id: Uuid, profile_id: Uuid) -> PortResult<()> {
        let row = {
            let mut state = self.state.lock().unwrap();
            let membership = state
                .members
                .iter_mut()
                .find(|m| m.chat_id == chat_id && m.profile_id == profile_id)
                .ok_or_else(|| not_found("membership"))?;
            membership.last_read_at = Some(Utc::now());
            membership_row(membership)
        };
        self.publish(Table::ChatMembers, ChangeKind::Update, row);
        Ok(())
    }

    async fn list_reports(&self, profile_id: Uuid) -> PortResult<Vec<ReportRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .reports
            .iter()
            .filter(|r| r.profile_id == profile_id)
            .cloned()
            .collect())
    }

    async fn subscribe(&self, filter: ChangeFilter) -> PortResult<ChangeStream> {
        Ok(self.changes.subscribe(filter))
    }
}

pub fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "DATABASE_URL" => Some("postgres://localhost/talk_diary_test".to_string()),
        _ => None,
    })
    .unwrap()
}

pub fn test_state(backend: Arc<FakeBackend>) -> Arc<AppState> {
    Arc::new(AppState {
        backend,
        config: Arc::new(test_config()),
    })
}
