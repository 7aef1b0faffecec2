//! Backend contracts — trait seams for the hosted collaborators.
//!
//! SYSTEM CONTEXT
//! ==============
//! The app owns no storage, no broker, and no auth protocol. Everything it
//! needs from the outside world comes through four contracts: a row CRUD
//! API, an insert-event feed, an object store, and a password-grant auth
//! endpoint. Production implementations live in `rest` and `realtime`; the
//! `memory` module provides the fake every service test runs against.

pub mod config;
pub mod memory;
pub mod realtime;
pub mod rest;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::event::{Data, ErrorCode, InsertEvent};

// =============================================================================
// API ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend rejected request: {status}: {body}")]
    Status { status: u16, body: String },
    #[error("row not found: {table}/{id}")]
    NotFound { table: String, id: Uuid },
    #[error("malformed row: {0}")]
    Decode(String),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "E_TRANSPORT",
            Self::Status { .. } => "E_STATUS",
            Self::NotFound { .. } => "E_ROW_NOT_FOUND",
            Self::Decode(_) => "E_DECODE",
        }
    }
}

// =============================================================================
// QUERY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One column filter, PostgREST-flavored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Exact match on a column.
    Eq(String, String),
    /// Case-insensitive substring match on a column.
    ILike(String, String),
}

/// A read query against one table. Built with the fluent methods below and
/// interpreted by each `DataApi` implementation.
#[derive(Debug, Clone)]
pub struct Query {
    pub table: String,
    /// Projection, including embedded joins (e.g. `*,usuarios(email,rol)`).
    pub select: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), select: None, filters: Vec::new(), order_by: None, limit: None }
    }

    #[must_use]
    pub fn select(mut self, projection: impl Into<String>) -> Self {
        self.select = Some(projection.into());
        self
    }

    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn ilike(mut self, column: impl Into<String>, needle: impl Into<String>) -> Self {
        self.filters.push(Filter::ILike(column.into(), needle.into()));
        self
    }

    #[must_use]
    pub fn order(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((column.into(), direction));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// DATA API
// =============================================================================

/// Row CRUD against the hosted relational API.
#[async_trait]
pub trait DataApi: Send + Sync {
    /// Insert a row. The backend assigns `id` and `created_at`; the returned
    /// row carries them.
    ///
    /// # Errors
    ///
    /// Returns a transport or backend rejection error.
    async fn insert(&self, table: &str, row: Data) -> Result<Data, ApiError>;

    /// Fetch one row by id with a projection (used for author enrichment).
    ///
    /// # Errors
    ///
    /// `NotFound` for an absent row; transport errors pass through.
    async fn fetch_by_id(&self, table: &str, id: Uuid, select: &str) -> Result<Data, ApiError>;

    /// Run a read query.
    ///
    /// # Errors
    ///
    /// Returns a transport or backend rejection error.
    async fn select(&self, query: &Query) -> Result<Vec<Data>, ApiError>;

    /// Hard-delete a row by id. Deleting an absent row is not an error.
    ///
    /// # Errors
    ///
    /// Returns a transport or backend rejection error.
    async fn delete(&self, table: &str, id: Uuid) -> Result<(), ApiError>;
}

// =============================================================================
// EVENT FEED
// =============================================================================

/// Connection state of a feed subscription, published through a watch
/// channel so callers can detect a dead feed and choose to resubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    /// The server ended the subscription cleanly.
    Closed,
    /// The transport gave up after exhausting reconnect attempts.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("already subscribed to table: {0}")]
    AlreadySubscribed(String),
    #[error("feed connect failed: {0}")]
    Connect(String),
}

impl ErrorCode for FeedError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadySubscribed(_) => "E_ALREADY_SUBSCRIBED",
            Self::Connect(_) => "E_FEED_CONNECT",
        }
    }
}

/// A live subscription to one table's insert-events.
///
/// Dropping the subscription releases the table slot and detaches the
/// transport; no event can be delivered after the drop.
pub struct FeedSubscription {
    /// Inbound insert-events, in backend emission order for this table.
    /// No ordering is guaranteed across subscriptions to different tables.
    pub events: mpsc::Receiver<InsertEvent>,
    /// Connection state, updated by the transport.
    pub status: watch::Receiver<FeedStatus>,
    _claim: TableClaim,
}

impl FeedSubscription {
    #[must_use]
    pub(crate) fn new(
        events: mpsc::Receiver<InsertEvent>,
        status: watch::Receiver<FeedStatus>,
        claim: TableClaim,
    ) -> Self {
        Self { events, status, _claim: claim }
    }
}

/// Server-push insert notifications, one subscription per table at a time.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Subscribe to insert-events for `table`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` while a previous subscription to the same
    /// table is still live — re-subscribing without unsubscribing first
    /// would duplicate event delivery.
    async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError>;
}

// =============================================================================
// SUBSCRIPTION SLOTS
// =============================================================================

/// Tracks which tables have a live subscription for one feed instance.
#[derive(Clone, Default)]
pub(crate) struct ActiveTables(Arc<Mutex<HashSet<String>>>);

impl ActiveTables {
    pub(crate) fn claim(&self, table: &str) -> Result<TableClaim, FeedError> {
        let mut tables = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !tables.insert(table.to_string()) {
            return Err(FeedError::AlreadySubscribed(table.to_string()));
        }
        Ok(TableClaim { tables: Self(Arc::clone(&self.0)), table: table.to_string() })
    }
}

/// RAII slot for one table subscription. Released on drop.
pub(crate) struct TableClaim {
    tables: ActiveTables,
    table: String,
}

impl Drop for TableClaim {
    fn drop(&mut self) {
        let mut tables = self
            .tables
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tables.remove(&self.table);
    }
}

// =============================================================================
// AUTH API
// =============================================================================

/// Result of a password-grant sign-in against the managed auth endpoint.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: Uuid,
    pub email: String,
    pub access_token: String,
}

/// Managed authentication endpoint. Token issuance and refresh are the
/// provider's problem; this contract only covers sign-in and sign-out.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for an access token.
    ///
    /// # Errors
    ///
    /// Rejected credentials surface as a `Status` error (400/401).
    async fn password_sign_in(&self, email: &str, password: &str) -> Result<AuthSession, ApiError>;

    /// Invalidate the current token on the provider.
    ///
    /// # Errors
    ///
    /// Returns a transport or backend rejection error.
    async fn sign_out(&self) -> Result<(), ApiError>;
}

// =============================================================================
// OBJECT STORE
// =============================================================================

/// Binary object storage for recipe photos.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object under `bucket/path`.
    ///
    /// # Errors
    ///
    /// Returns a transport or backend rejection error.
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ApiError>;

    /// Public URL for a stored object. Pure formatting, no network.
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

// =============================================================================
// BEARER TOKEN
// =============================================================================

/// Shared bearer token slot. Set on sign-in, cleared on sign-out, read by
/// the REST client on every request. Falls back to the anon key when empty.
#[derive(Clone, Default)]
pub struct AuthToken(Arc<std::sync::RwLock<Option<String>>>);

impl AuthToken {
    pub fn set(&self, token: impl Into<String>) {
        let mut slot = self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(token.into());
    }

    pub fn clear(&self) {
        let mut slot = self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = None;
    }

    #[must_use]
    pub fn get(&self) -> Option<String> {
        let slot = self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.clone()
    }
}

// =============================================================================
// TESTS
// =============================================================================
