//! Chat message relay — mirrors the shared message log into local state.
//!
//! DESIGN
//! ======
//! The message log is authoritative and append-only on the backend. This
//! relay does three things on top of it: resolves each inbound insert-event
//! to an enriched record (the raw event payload has no author join), sends
//! outbound messages fire-and-forget (the sender sees its own message via
//! the subscription echo, not the insert response), and deletes by id.
//!
//! ERROR HANDLING
//! ==============
//! Enrichment failure is degraded, never surfaced: the event still reaches
//! the caller as a minimally-populated message with the placeholder author.
//! Validation (`EmptyContent`) and auth (`Unauthenticated`) failures are
//! returned as values. The relay performs no de-duplication — the caller's
//! `MessageLog` ignores ids it already holds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{ApiError, DataApi, Direction, EventFeed, FeedError, Query};
use crate::event::{Data, ErrorCode, InsertEvent};

use super::WatchHandle;
use super::auth::SessionHandle;

/// Append-only log of chat messages.
pub const MESSAGES_TABLE: &str = "mensajes";

/// Enrichment projection: the row plus the author's profile fields.
const MESSAGE_SELECT: &str = "*,usuarios(email,rol)";

// =============================================================================
// TYPES
// =============================================================================

/// Denormalized author fields carried on every displayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub email: String,
    pub rol: String,
}

impl Author {
    /// Placeholder used when enrichment is unavailable.
    #[must_use]
    pub fn desconocido() -> Self {
        Self { email: "Desconocido".to_string(), rol: "usuario".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub content: String,
    pub author_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub author: Author,
}

impl ChatMessage {
    /// Build from a fetched row or a raw event record. Only `id` is
    /// required; everything else degrades (placeholder author, empty
    /// content) so an event is never dropped for being partial.
    #[must_use]
    pub fn from_row(row: &Data) -> Option<Self> {
        let id = row.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok())?;
        let content = row
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let author_id = row
            .get("author_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Uuid::nil);
        let created_at = row
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);
        let author = row
            .get("usuarios")
            .and_then(|v| v.as_object())
            .map_or_else(Author::desconocido, |user| Author {
                email: user
                    .get("email")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Desconocido")
                    .to_string(),
                rol: user
                    .get("rol")
                    .and_then(|v| v.as_str())
                    .unwrap_or("usuario")
                    .to_string(),
            });

        Some(Self { id, content, author_id, created_at, author })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("no active session")]
    Unauthenticated,
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("backend error: {0}")]
    Backend(#[from] ApiError),
}

impl ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyContent => "E_EMPTY_CONTENT",
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::Feed(_) => "E_FEED",
            Self::Backend(_) => "E_BACKEND",
        }
    }
}

// =============================================================================
// RELAY
// =============================================================================

pub struct MessageRelay {
    api: Arc<dyn DataApi>,
    feed: Arc<dyn EventFeed>,
    session: SessionHandle,
}

impl MessageRelay {
    #[must_use]
    pub fn new(api: Arc<dyn DataApi>, feed: Arc<dyn EventFeed>, session: SessionHandle) -> Self {
        Self { api, feed, session }
    }

    /// Recent history, oldest first. The backend is queried newest-first
    /// up to `limit` and the page is reversed locally — callers must not
    /// assume the backing query returns ascending order.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    pub async fn fetch_recent(&self, limit: usize) -> Result<Vec<ChatMessage>, ChatError> {
        let query = Query::new(MESSAGES_TABLE)
            .select(MESSAGE_SELECT)
            .order("created_at", Direction::Descending)
            .limit(limit);
        let rows = self.api.select(&query).await?;

        let mut messages: Vec<ChatMessage> = rows.iter().filter_map(ChatMessage::from_row).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Insert a message. Fire-and-forget for UI purposes: the caller sees
    /// the message appear through the subscription echo, not this call.
    ///
    /// # Errors
    ///
    /// `EmptyContent` if `content` is blank after trimming (no insert is
    /// issued), `Unauthenticated` without an active session.
    pub async fn send(&self, content: &str) -> Result<(), ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let Some(session) = self.session.current() else {
            return Err(ChatError::Unauthenticated);
        };

        let mut row = Data::new();
        row.insert("content".into(), serde_json::json!(content));
        row.insert("author_id".into(), serde_json::json!(session.user_id.to_string()));
        self.api.insert(MESSAGES_TABLE, row).await?;
        Ok(())
    }

    /// Hard-delete by id. The caller drops the row from local state only
    /// after this succeeds; there is no tombstone.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the delete fails.
    pub async fn delete(&self, id: Uuid) -> Result<(), ChatError> {
        self.api.delete(MESSAGES_TABLE, id).await?;
        Ok(())
    }

    /// Subscribe to the message log. Each insert-event is resolved to an
    /// enriched message and handed to `on_insert` — duplicates included;
    /// de-duplication is the caller's job (`MessageLog::insert_unique`).
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` while a previous message watch on this
    /// feed is still live.
    pub async fn watch<F>(&self, on_insert: F) -> Result<WatchHandle, ChatError>
    where
        F: Fn(ChatMessage) + Send + 'static,
    {
        let mut sub = self.feed.subscribe(MESSAGES_TABLE).await.map_err(ChatError::Feed)?;
        let status = sub.status.clone();
        let api = Arc::clone(&self.api);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    maybe_event = sub.events.recv() => {
                        let Some(event) = maybe_event else { break };
                        if let Some(message) = resolve(api.as_ref(), &event).await {
                            on_insert(message);
                        }
                    }
                }
            }
        });

        Ok(WatchHandle::new(shutdown_tx, task, status))
    }
}

/// Resolve an insert-event to a full message, enriching by id. A failed
/// enrichment fetch degrades to the raw event record with the placeholder
/// author rather than dropping the event.
async fn resolve(api: &dyn DataApi, event: &InsertEvent) -> Option<ChatMessage> {
    let Some(id) = event.uuid_field("id") else {
        warn!(table = %event.table, "insert-event without id; skipping");
        return None;
    };

    match api.fetch_by_id(MESSAGES_TABLE, id, MESSAGE_SELECT).await {
        Ok(row) => ChatMessage::from_row(&row),
        Err(e) => {
            warn!(error = %e, %id, "message enrichment failed; using placeholder author");
            ChatMessage::from_row(&event.record)
        }
    }
}

// =============================================================================
// MESSAGE LOG (caller-side state)
// =============================================================================

/// The UI-facing message list. Owns de-duplication: the relay hands over
/// every resolved event, including echoes of rows already fetched as
/// history, and this log ignores ids it already holds.
#[derive(Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full list with fetched history.
    pub fn replace_history(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    /// Append unless a message with the same id is already present.
    /// Returns `true` when the message was added.
    pub fn insert_unique(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Drop a message by id, after a successful backend delete.
    pub fn remove(&mut self, id: Uuid) {
        self.messages.retain(|m| m.id != id);
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
