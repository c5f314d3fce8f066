//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the API server.
//! The socket only pushes live updates; all reads and writes go through the REST API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::web::rest::MessageResponse;

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts pushing new messages of an open chat room. Replaces any previous
    /// chat or chat-list watch.
    WatchChat { chat_id: Uuid },

    /// Starts pushing unread-count changes for the chat list.
    WatchChatList,

    /// Stops the current chat or chat-list watch. Report notifications continue.
    Unwatch,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms a watch request. `chat_id` is absent for the chat list.
    Watching {
        #[serde(skip_serializing_if = "Option::is_none")]
        chat_id: Option<Uuid>,
    },

    /// A message arrived in the watched chat. The chat has been marked read.
    MessageCreated { message: MessageResponse },

    /// A member chat changed; the client should refresh its chat list.
    ChatListChanged { total_unread: u64 },

    /// A new daily report was stored for the user.
    ReportAvailable { report_id: Uuid },

    Error { message: String },
}
