//! services/api/src/web/ws_handler.rs
//!
//! The live-update socket. Each connection always receives report notifications
//! for its user and, on request, watches one chat room or the chat list. Every
//! watch runs as its own task fed by a backend change stream.

use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    rest::MessageResponse,
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{self, StreamExt},
    Sink, SinkExt,
};
use std::future::Future;
use std::sync::Arc;
use talk_diary_core::chat::total_unread;
use talk_diary_core::ports::{ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, Table};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The write half of a socket, shared by the watch tasks of one connection.
type WsSender<S> = Arc<Mutex<S>>;

/// A running watch task and the token that stops it.
struct Watch {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Watch {
    fn stop(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(profile_id): Extension<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, profile_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, profile_id: Uuid) {
    info!("New WebSocket connection established for profile: {}", profile_id);

    let (sender, mut receiver) = socket.split();
    let ws_sender = Arc::new(Mutex::new(sender));
    let connection_token = CancellationToken::new();

    // --- 1. Report notifications for the lifetime of the connection ---
    let report_watch = match watch_reports(&app_state, &ws_sender, profile_id, &connection_token)
        .await
    {
        Ok(watch) => Some(watch),
        Err(message) => {
            send(&ws_sender, &ServerMessage::Error { message }).await;
            None
        }
    };

    // --- 2. Main Message Loop ---
    let mut current_watch: Option<Watch> = None;
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(
                    text.as_str(),
                    &app_state,
                    profile_id,
                    &ws_sender,
                    &connection_token,
                    &mut current_watch,
                )
                .await;
            }
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
            None => {
                info!("Client disconnected.");
                break;
            }
        }
    }

    // --- 3. Cleanup ---
    connection_token.cancel();
    if let Some(watch) = current_watch {
        watch.stop();
    }
    if let Some(watch) = report_watch {
        watch.stop();
    }
    info!("WebSocket connection closed for profile: {}", profile_id);
}

async fn handle_text_message<S>(
    text: &str,
    app_state: &Arc<AppState>,
    profile_id: Uuid,
    ws_sender: &WsSender<S>,
    connection_token: &CancellationToken,
    current_watch: &mut Option<Watch>,
) where
    S: Sink<Message> + Unpin + Send + 'static,
{
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            let message = format!("Unrecognized message: {}", e);
            send(ws_sender, &ServerMessage::Error { message }).await;
            return;
        }
    };

    // Only one chat or chat-list watch is active at a time. A rejected request
    // leaves the current one running.
    let started = match client_msg {
        ClientMessage::WatchChat { chat_id } => {
            watch_chat(app_state, ws_sender, profile_id, chat_id, connection_token)
                .await
                .map(|watch| (watch, Some(chat_id)))
        }
        ClientMessage::WatchChatList => {
            watch_chat_list(app_state, ws_sender, profile_id, connection_token)
                .await
                .map(|watch| (watch, None))
        }
        ClientMessage::Unwatch => {
            if let Some(watch) = current_watch.take() {
                watch.stop();
            }
            debug!("Watch stopped by client.");
            return;
        }
    };

    match started {
        Ok((watch, chat_id)) => {
            if let Some(previous) = current_watch.replace(watch) {
                previous.stop();
            }
            send(ws_sender, &ServerMessage::Watching { chat_id }).await;
        }
        Err(message) => {
            send(ws_sender, &ServerMessage::Error { message }).await;
        }
    }
}

//=========================================================================================
// Watches
//=========================================================================================

async fn watch_reports<S>(
    app_state: &Arc<AppState>,
    ws_sender: &WsSender<S>,
    profile_id: Uuid,
    connection_token: &CancellationToken,
) -> Result<Watch, String>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    let filter = ChangeFilter::on(Table::Reports)
        .kind(ChangeKind::Insert)
        .where_eq("user_id", profile_id);
    let changes = subscribe(app_state, filter).await?;

    let ws_sender = ws_sender.clone();
    Ok(spawn_watch(connection_token, changes, move |event| {
        let ws_sender = ws_sender.clone();
        async move {
            match event.uuid("id") {
                Some(report_id) => {
                    send(&ws_sender, &ServerMessage::ReportAvailable { report_id }).await
                }
                None => {
                    warn!("Report change without an id: {}", event.record);
                    true
                }
            }
        }
    }))
}

/// Pushes every new message of `chat_id` and keeps the chat marked read while
/// the room is open.
async fn watch_chat<S>(
    app_state: &Arc<AppState>,
    ws_sender: &WsSender<S>,
    profile_id: Uuid,
    chat_id: Uuid,
    connection_token: &CancellationToken,
) -> Result<Watch, String>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    let member = app_state
        .backend
        .is_member(chat_id, profile_id)
        .await
        .map_err(|e| {
            error!("Failed to check chat membership: {:?}", e);
            "Failed to open chat.".to_string()
        })?;
    if !member {
        return Err("Join the chat before watching it.".to_string());
    }

    let filter = ChangeFilter::on(Table::Messages)
        .kind(ChangeKind::Insert)
        .where_eq("chat_id", chat_id);
    let changes = subscribe(app_state, filter).await?;

    let app_state = app_state.clone();
    let ws_sender = ws_sender.clone();
    Ok(spawn_watch(connection_token, changes, move |event| {
        let app_state = app_state.clone();
        let ws_sender = ws_sender.clone();
        async move {
            let Some(message_id) = event.uuid("id") else {
                warn!("Message change without an id: {}", event.record);
                return true;
            };
            // The change feed leaves out `content`, so read the row back.
            let message = match app_state.backend.get_message(message_id).await {
                Ok(message) => message,
                Err(e) => {
                    error!("Failed to load message {}: {:?}", message_id, e);
                    return true;
                }
            };
            // A pushed message is already counted as read.
            if let Err(e) = app_state.backend.mark_read(chat_id, profile_id).await {
                warn!("Failed to mark chat {} as read: {:?}", chat_id, e);
            }
            send(
                &ws_sender,
                &ServerMessage::MessageCreated {
                    message: MessageResponse::from(message),
                },
            )
            .await
        }
    }))
}

/// Pushes the new unread total whenever a member chat receives a message or
/// the user's memberships change.
async fn watch_chat_list<S>(
    app_state: &Arc<AppState>,
    ws_sender: &WsSender<S>,
    profile_id: Uuid,
    connection_token: &CancellationToken,
) -> Result<Watch, String>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    let messages = subscribe(
        app_state,
        ChangeFilter::on(Table::Messages).kind(ChangeKind::Insert),
    )
    .await?;
    let memberships = subscribe(
        app_state,
        ChangeFilter::on(Table::ChatMembers).where_eq("user_id", profile_id),
    )
    .await?;
    let changes: ChangeStream = Box::pin(stream::select(messages, memberships));

    let app_state = app_state.clone();
    let ws_sender = ws_sender.clone();
    Ok(spawn_watch(connection_token, changes, move |event| {
        let app_state = app_state.clone();
        let ws_sender = ws_sender.clone();
        async move {
            if event.table == Table::Messages {
                let Some(chat_id) = event.uuid("chat_id") else {
                    return true;
                };
                match app_state.backend.is_member(chat_id, profile_id).await {
                    Ok(true) => {}
                    Ok(false) => return true,
                    Err(e) => {
                        warn!("Failed to check chat membership: {:?}", e);
                        return true;
                    }
                }
            }
            match app_state.backend.list_member_chats(profile_id).await {
                Ok(chats) => {
                    let total_unread = total_unread(&chats);
                    send(&ws_sender, &ServerMessage::ChatListChanged { total_unread }).await
                }
                Err(e) => {
                    error!("Failed to refresh chat list: {:?}", e);
                    true
                }
            }
        }
    }))
}

//=========================================================================================
// Helpers
//=========================================================================================

async fn subscribe(app_state: &AppState, filter: ChangeFilter) -> Result<ChangeStream, String> {
    app_state.backend.subscribe(filter).await.map_err(|e| {
        error!("Failed to subscribe to change feed: {:?}", e);
        "Live updates are unavailable.".to_string()
    })
}

/// Runs `on_event` for each change until the stream ends, the token is
/// cancelled, or `on_event` returns `false` (the client is gone).
fn spawn_watch<F, Fut>(
    connection_token: &CancellationToken,
    mut changes: ChangeStream,
    mut on_event: F,
) -> Watch
where
    F: FnMut(ChangeEvent) -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let token = connection_token.child_token();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                next = changes.next() => match next {
                    Some(Ok(event)) => {
                        if !on_event(event).await {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("Change feed error: {:?}", e),
                    None => {
                        debug!("Change feed ended.");
                        break;
                    }
                },
            }
        }
    });
    Watch { token, handle }
}

/// Sends a server message, returning `false` once the socket is closed.
async fn send<S>(ws_sender: &WsSender<S>, msg: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            return true;
        }
    };
    ws_sender
        .lock()
        .await
        .send(Message::Text(json.into()))
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::change_feed::ChangeFeed;
    use crate::testing::{test_state, FakeBackend};
    use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
    use serde_json::{json, Value};
    use std::time::Duration;
    use talk_diary_core::ports::BackendService;
    use tokio::time::timeout;

    /// One socket connection, with the pushed messages collected in `outbox`.
    struct Connection {
        app_state: Arc<AppState>,
        profile_id: Uuid,
        ws_sender: WsSender<UnboundedSender<Message>>,
        outbox: UnboundedReceiver<Message>,
        token: CancellationToken,
        watch: Option<Watch>,
    }

    impl Connection {
        fn open(backend: &Arc<FakeBackend>, profile_id: Uuid) -> Self {
            let (sender, outbox) = mpsc::unbounded();
            Self {
                app_state: test_state(backend.clone()),
                profile_id,
                ws_sender: Arc::new(Mutex::new(sender)),
                outbox,
                token: CancellationToken::new(),
                watch: None,
            }
        }

        async fn request(&mut self, msg: Value) {
            handle_text_message(
                &msg.to_string(),
                &self.app_state,
                self.profile_id,
                &self.ws_sender,
                &self.token,
                &mut self.watch,
            )
            .await;
        }

        async fn pushed(&mut self) -> Value {
            let msg = timeout(Duration::from_secs(1), self.outbox.next())
                .await
                .expect("nothing was pushed")
                .expect("socket closed");
            match msg {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        async fn assert_quiet(&mut self) {
            let next = timeout(Duration::from_millis(100), self.outbox.next()).await;
            assert!(next.is_err(), "unexpected push: {:?}", next);
        }
    }

    #[tokio::test]
    async fn report_inserts_reach_only_their_owner() {
        let backend = Arc::new(FakeBackend::default());
        let (liam, sarah) = (Uuid::new_v4(), Uuid::new_v4());
        let mut conn = Connection::open(&backend, liam);
        let watch = watch_reports(&conn.app_state, &conn.ws_sender, liam, &conn.token)
            .await
            .unwrap();

        backend.add_report(sarah, json!({}));
        let report_id = backend.add_report(liam, json!({}));

        let msg = conn.pushed().await;
        assert_eq!(msg["type"], "report_available");
        assert_eq!(msg["report_id"], report_id.to_string());
        conn.assert_quiet().await;
        watch.stop();
    }

    #[tokio::test]
    async fn watched_chat_pushes_messages_and_marks_them_read() {
        let backend = Arc::new(FakeBackend::default());
        let (liam, sarah) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = backend.create_chat("Weekend", liam).await.unwrap();
        backend.join_chat(chat.id, sarah).await.unwrap();

        let mut conn = Connection::open(&backend, sarah);
        conn.request(json!({ "type": "watch_chat", "chat_id": chat.id })).await;
        assert_eq!(
            conn.pushed().await,
            json!({ "type": "watching", "chat_id": chat.id })
        );

        let sent = backend.send_message(chat.id, liam, "hi!").await.unwrap();
        let msg = conn.pushed().await;
        assert_eq!(msg["type"], "message_created");
        assert_eq!(msg["message"]["id"], sent.id.to_string());
        assert_eq!(msg["message"]["content"], "hi!");

        let chats = backend.list_member_chats(sarah).await.unwrap();
        assert_eq!(chats[0].unread_count, 0);
    }

    #[tokio::test]
    async fn watching_a_foreign_chat_is_rejected() {
        let backend = Arc::new(FakeBackend::default());
        let (liam, sarah) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = backend.create_chat("Private", liam).await.unwrap();

        let mut conn = Connection::open(&backend, sarah);
        conn.request(json!({ "type": "watch_chat", "chat_id": chat.id })).await;
        assert_eq!(conn.pushed().await["type"], "error");
        assert!(conn.watch.is_none());

        backend.send_message(chat.id, liam, "secret").await.unwrap();
        conn.assert_quiet().await;
    }

    #[tokio::test]
    async fn rejected_watch_keeps_the_current_one() {
        let backend = Arc::new(FakeBackend::default());
        let (liam, sarah) = (Uuid::new_v4(), Uuid::new_v4());
        let open = backend.create_chat("Weekend", liam).await.unwrap();
        backend.join_chat(open.id, sarah).await.unwrap();
        let private = backend.create_chat("Private", liam).await.unwrap();

        let mut conn = Connection::open(&backend, sarah);
        conn.request(json!({ "type": "watch_chat", "chat_id": open.id })).await;
        assert_eq!(conn.pushed().await["type"], "watching");
        conn.request(json!({ "type": "watch_chat", "chat_id": private.id })).await;
        assert_eq!(conn.pushed().await["type"], "error");

        backend.send_message(open.id, liam, "still here").await.unwrap();
        let msg = conn.pushed().await;
        assert_eq!(msg["type"], "message_created");
        assert_eq!(msg["message"]["content"], "still here");
    }

    #[tokio::test]
    async fn unwatch_stops_the_current_watch() {
        let backend = Arc::new(FakeBackend::default());
        let liam = Uuid::new_v4();
        let chat = backend.create_chat("Weekend", liam).await.unwrap();

        let mut conn = Connection::open(&backend, liam);
        conn.request(json!({ "type": "watch_chat", "chat_id": chat.id })).await;
        assert_eq!(conn.pushed().await["type"], "watching");
        conn.request(json!({ "type": "unwatch" })).await;
        assert!(conn.watch.is_none());

        backend.send_message(chat.id, liam, "anyone?").await.unwrap();
        conn.assert_quiet().await;
    }

    #[tokio::test]
    async fn chat_list_counts_only_member_chats() {
        let backend = Arc::new(FakeBackend::default());
        let (liam, sarah) = (Uuid::new_v4(), Uuid::new_v4());

        let mut conn = Connection::open(&backend, sarah);
        conn.request(json!({ "type": "watch_chat_list" })).await;
        assert_eq!(conn.pushed().await, json!({ "type": "watching" }));

        let foreign = backend.create_chat("Private", liam).await.unwrap();
        backend.send_message(foreign.id, liam, "secret").await.unwrap();
        conn.assert_quiet().await;

        let shared = backend.create_chat("Weekend", liam).await.unwrap();
        backend.join_chat(shared.id, sarah).await.unwrap();
        assert_eq!(
            conn.pushed().await,
            json!({ "type": "chat_list_changed", "total_unread": 0 })
        );

        backend.send_message(shared.id, liam, "hi!").await.unwrap();
        assert_eq!(
            conn.pushed().await,
            json!({ "type": "chat_list_changed", "total_unread": 1 })
        );
    }

    #[tokio::test]
    async fn switching_watches_replaces_the_subscription() {
        let backend = Arc::new(FakeBackend::default());
        let liam = Uuid::new_v4();
        let chat = backend.create_chat("Weekend", liam).await.unwrap();

        let mut conn = Connection::open(&backend, liam);
        conn.request(json!({ "type": "watch_chat", "chat_id": chat.id })).await;
        assert_eq!(conn.pushed().await["type"], "watching");
        conn.request(json!({ "type": "watch_chat_list" })).await;
        assert_eq!(conn.pushed().await, json!({ "type": "watching" }));

        backend.send_message(chat.id, liam, "hi!").await.unwrap();
        assert_eq!(conn.pushed().await["type"], "chat_list_changed");
        conn.assert_quiet().await;
    }

    #[tokio::test]
    async fn watch_stops_on_cancel() {
        let feed = ChangeFeed::default();
        let token = CancellationToken::new();
        let changes = feed.subscribe(ChangeFilter::on(Table::Chats));
        let watch = spawn_watch(&token, changes, |_| async { true });

        token.cancel();
        let finished = timeout(Duration::from_secs(1), watch.handle).await;
        assert!(finished.unwrap().is_ok());
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn watch_stops_once_the_client_is_gone() {
        let feed = ChangeFeed::default();
        let token = CancellationToken::new();
        let changes = feed.subscribe(ChangeFilter::on(Table::Chats));
        let watch = spawn_watch(&token, changes, |_| async { false });

        feed.publish(ChangeEvent {
            table: Table::Chats,
            kind: ChangeKind::Insert,
            record: json!({ "id": Uuid::new_v4() }),
        });
        let finished = timeout(Duration::from_secs(1), watch.handle).await;
        assert!(finished.unwrap().is_ok());
        assert!(!token.is_cancelled());
    }
}
