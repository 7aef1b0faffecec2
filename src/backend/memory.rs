//! In-memory backend fake — every contract, no network.
//!
//! DESIGN
//! ======
//! `MemoryBackend` implements `DataApi`, `EventFeed`, `ObjectStore`, and
//! `AuthApi` against plain maps so services can be exercised in isolation.
//! It mirrors the one coupling that matters for fidelity: a successful
//! `insert` also pushes an insert-event to the table's live subscription,
//! exactly like the hosted backend's change feed. Test hooks cover the
//! failure paths the real transport produces (enrichment fetch failure,
//! feed closure) and the counters the properties are asserted against.
//!
//! The embedded-join emulation is fixture-grade: a projection that names
//! another table (e.g. `*,usuarios(email,rol)`) embeds the row from that
//! table whose `id` matches the outer row's `author_id`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::event::{Data, InsertEvent};

use super::{
    ActiveTables, ApiError, AuthApi, AuthSession, DataApi, Direction, EventFeed, FeedError, FeedStatus,
    FeedSubscription, Filter, ObjectStore, Query,
};

const FEED_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// STATE
// =============================================================================

struct FeedSender {
    events: mpsc::Sender<InsertEvent>,
    status: watch::Sender<FeedStatus>,
}

#[derive(Default)]
struct MemoryInner {
    /// Rows per table, in insertion order.
    tables: HashMap<String, Vec<Data>>,
    /// Live feed subscription per table.
    subscribers: HashMap<String, FeedSender>,
    /// Registered credentials: email -> (password, user id).
    credentials: HashMap<String, (String, Uuid)>,
    /// Uploaded objects keyed by `bucket/path`.
    uploads: HashMap<String, Vec<u8>>,
    inserts_per_table: HashMap<String, usize>,
    fetches: usize,
    fail_next_fetch: bool,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
    active: ActiveTables,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Store a row without emitting an insert-event.
    pub fn seed_row(&self, table: &str, row: Data) {
        let mut inner = self.lock();
        inner.tables.entry(table.to_string()).or_default().push(row);
    }

    /// Register a user for `password_sign_in` and seed their `usuarios` row.
    pub fn register_user(&self, email: &str, password: &str, rol: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        let mut row = Data::new();
        row.insert("id".into(), serde_json::json!(user_id.to_string()));
        row.insert("email".into(), serde_json::json!(email));
        row.insert("rol".into(), serde_json::json!(rol));

        let mut inner = self.lock();
        inner.tables.entry("usuarios".to_string()).or_default().push(row);
        inner
            .credentials
            .insert(email.to_string(), (password.to_string(), user_id));
        user_id
    }

    /// Deliver a raw insert-event to the table's live subscription, exactly
    /// as the server-push feed would. Does not touch stored rows.
    pub fn push_event(&self, table: &str, record: Data) {
        let inner = self.lock();
        if let Some(sender) = inner.subscribers.get(table) {
            let _ = sender.events.try_send(InsertEvent::new(table, record));
        }
    }

    /// End the table's subscription as a clean server-side close.
    pub fn close_feed(&self, table: &str) {
        let mut inner = self.lock();
        if let Some(sender) = inner.subscribers.remove(table) {
            let _ = sender.status.send(FeedStatus::Closed);
        }
    }

    /// End the table's subscription as a transport failure.
    pub fn fail_feed(&self, table: &str) {
        let mut inner = self.lock();
        if let Some(sender) = inner.subscribers.remove(table) {
            let _ = sender.status.send(FeedStatus::Failed);
        }
    }

    /// Make the next `fetch_by_id` fail with a transport error.
    pub fn fail_next_fetch(&self) {
        self.lock().fail_next_fetch = true;
    }

    #[must_use]
    pub fn insert_count(&self, table: &str) -> usize {
        self.lock().inserts_per_table.get(table).copied().unwrap_or(0)
    }

    /// Number of `fetch_by_id` calls observed (enrichment counter).
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Data> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn uploaded(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().uploads.get(&format!("{bucket}/{path}")).cloned()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Embed joined rows named by the projection, resolving `author_id` against
/// the referenced table's `id`.
fn apply_embeds(inner: &MemoryInner, select: &str, row: &mut Data) {
    for segment in select.split(',') {
        let Some((embed_table, _)) = segment.split_once('(') else {
            continue;
        };
        let Some(fk) = row.get("author_id").and_then(|v| v.as_str()) else {
            continue;
        };
        let embedded = inner
            .tables
            .get(embed_table)
            .and_then(|rows| rows.iter().find(|r| r.get("id").and_then(|v| v.as_str()) == Some(fk)));
        if let Some(user_row) = embedded {
            row.insert(
                embed_table.to_string(),
                serde_json::Value::Object(user_row.clone().into_iter().collect()),
            );
        }
    }
}

fn row_id(row: &Data) -> Option<&str> {
    row.get("id").and_then(|v| v.as_str())
}

fn cmp_values(a: &serde_json::Value, b: &serde_json::Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => {
            let x = a.as_str().map_or_else(|| a.to_string(), str::to_string);
            let y = b.as_str().map_or_else(|| b.to_string(), str::to_string);
            x.cmp(&y)
        }
    }
}

fn matches_filter(row: &Data, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, value) => row
            .get(column)
            .is_some_and(|v| v.as_str().map_or_else(|| v.to_string() == *value, |s| s == value)),
        Filter::ILike(column, needle) => {
            let needle = needle.trim_matches('%').to_lowercase();
            row.get(column)
                .and_then(|v| v.as_str())
                .is_some_and(|s| s.to_lowercase().contains(&needle))
        }
    }
}

// =============================================================================
// DATA API
// =============================================================================

#[async_trait]
impl DataApi for MemoryBackend {
    async fn insert(&self, table: &str, mut row: Data) -> Result<Data, ApiError> {
        let mut inner = self.lock();

        if !row.contains_key("id") {
            row.insert("id".into(), serde_json::json!(Uuid::new_v4().to_string()));
        }
        if !row.contains_key("created_at") {
            let now = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            row.insert("created_at".into(), serde_json::json!(now));
        }

        inner.tables.entry(table.to_string()).or_default().push(row.clone());
        *inner.inserts_per_table.entry(table.to_string()).or_default() += 1;

        // The hosted backend's change feed fires on every committed insert.
        if let Some(sender) = inner.subscribers.get(table) {
            let _ = sender.events.try_send(InsertEvent::new(table, row.clone()));
        }

        Ok(row)
    }

    async fn fetch_by_id(&self, table: &str, id: Uuid, select: &str) -> Result<Data, ApiError> {
        let mut inner = self.lock();
        inner.fetches += 1;
        if inner.fail_next_fetch {
            inner.fail_next_fetch = false;
            return Err(ApiError::Transport("simulated fetch failure".into()));
        }

        let id_str = id.to_string();
        let found = inner
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| row_id(r) == Some(id_str.as_str())))
            .cloned();

        let Some(mut row) = found else {
            return Err(ApiError::NotFound { table: table.to_string(), id });
        };
        apply_embeds(&inner, select, &mut row);
        Ok(row)
    }

    async fn select(&self, query: &Query) -> Result<Vec<Data>, ApiError> {
        let inner = self.lock();
        let mut rows: Vec<Data> = inner
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.filters.iter().all(|f| matches_filter(r, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, direction)) = &query.order_by {
            rows.sort_by(|a, b| {
                let ord = match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) => cmp_values(x, y),
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if let Some(select) = &query.select {
            for row in &mut rows {
                apply_embeds(&inner, select, row);
            }
        }
        Ok(rows)
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), ApiError> {
        let mut inner = self.lock();
        let id_str = id.to_string();
        if let Some(rows) = inner.tables.get_mut(table) {
            rows.retain(|r| row_id(r) != Some(id_str.as_str()));
        }
        Ok(())
    }
}

// =============================================================================
// EVENT FEED
// =============================================================================

#[async_trait]
impl EventFeed for MemoryBackend {
    async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError> {
        let claim = self.active.claim(table)?;
        let (event_tx, event_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connected);

        let mut inner = self.lock();
        inner
            .subscribers
            .insert(table.to_string(), FeedSender { events: event_tx, status: status_tx });

        Ok(FeedSubscription::new(event_rx, status_rx, claim))
    }
}

// =============================================================================
// OBJECT STORE
// =============================================================================

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.uploads.insert(format!("{bucket}/{path}"), bytes);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }
}

// =============================================================================
// AUTH API
// =============================================================================

#[async_trait]
impl AuthApi for MemoryBackend {
    async fn password_sign_in(&self, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        let inner = self.lock();
        match inner.credentials.get(email) {
            Some((stored, user_id)) if stored == password => Ok(AuthSession {
                user_id: *user_id,
                email: email.to_string(),
                access_token: format!("tok-{}", Uuid::new_v4()),
            }),
            _ => Err(ApiError::Status { status: 401, body: "invalid_grant".into() }),
        }
    }

    async fn sign_out(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
