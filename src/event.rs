//! Insert-event — the inbound notification type for the realtime feed.
//!
//! ARCHITECTURE
//! ============
//! The hosted backend pushes a notification whenever a row is appended to a
//! watched table. The payload is the raw inserted row as a flat key/value
//! map; joined fields (author email/rol) are never included and must be
//! re-fetched by id. Both the websocket transport and the in-memory fake
//! produce this same type, so every consumer downstream of the feed is
//! transport-agnostic.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value row payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// A server-pushed notification that a row was appended to a watched table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertEvent {
    /// Table the row was inserted into.
    pub table: String,
    /// Raw fields of the inserted row. No joins, no enrichment.
    pub record: Data,
    /// Milliseconds since Unix epoch, stamped on receipt.
    pub ts: i64,
}

impl InsertEvent {
    /// Build an event stamped with the current time.
    pub fn new(table: impl Into<String>, record: Data) -> Self {
        Self { table: table.into(), record, ts: now_ms() }
    }

    /// String field accessor.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.record.get(key).and_then(|v| v.as_str())
    }

    /// UUID field accessor. Rows carry ids as strings on the wire.
    #[must_use]
    pub fn uuid_field(&self, key: &str) -> Option<Uuid> {
        self.str_field(key).and_then(|s| s.parse().ok())
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code for structured service errors.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================
