//! services/api/src/adapters/change_feed.rs
//!
//! The backend's row-change feed. Database triggers `pg_notify` a compact JSON
//! row image (see `migrations/*_change_feed.sql`). One process-wide listener
//! decodes those notifications and fans them out to every subscriber through a
//! broadcast channel, so subscribers never hold a database connection.

use futures::{future, stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgListener;
use std::time::Duration;
use talk_diary_core::ports::{
    ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, PortError, PortResult, Table,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The `NOTIFY` channel every change trigger publishes on.
pub const CHANGE_CHANNEL: &str = "row_changes";

/// Events buffered per subscriber before a slow one starts skipping.
const FEED_CAPACITY: usize = 1024;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
struct Notification {
    table: String,
    kind: String,
    #[serde(default)]
    record: Value,
}

/// Parses one notification payload.
pub fn parse_notification(payload: &str) -> PortResult<ChangeEvent> {
    let notification: Notification = serde_json::from_str(payload)
        .map_err(|e| PortError::Unexpected(format!("malformed change notification: {}", e)))?;

    Ok(ChangeEvent {
        table: notification.table.parse::<Table>()?,
        kind: notification.kind.parse::<ChangeKind>()?,
        record: notification.record,
    })
}

/// Fan-out point for change events. Cloning shares the same channel.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Delivers an event to every current subscriber.
    pub fn publish(&self, event: ChangeEvent) {
        // An error only means nobody is subscribed right now.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// A stream of the events matching `filter`, starting now. Dropping the
    /// stream unsubscribes.
    pub fn subscribe(&self, filter: ChangeFilter) -> ChangeStream {
        let receiver = self.sender.subscribe();
        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change feed subscriber fell behind");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Box::pin(
            events
                .filter(move |event| future::ready(filter.matches(event)))
                .map(Ok::<_, PortError>),
        )
    }

    /// Opens the single `LISTEN` connection on its own connection (not from
    /// the query pool) and forwards its notifications into the feed.
    pub async fn listen(&self, database_url: &str) -> Result<JoinHandle<()>, sqlx::Error> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "Listening for row changes");

        let feed = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match parse_notification(notification.payload()) {
                        Ok(event) => feed.publish(event),
                        Err(e) => warn!("Dropping change notification: {}", e),
                    },
                    // `recv` reconnects on the next call; back off meanwhile.
                    Err(e) => {
                        error!("Change feed listener error: {}", e);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }))
    }
}
