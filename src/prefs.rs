//! Local flag store — persisted string key/value pairs.
//!
//! DESIGN
//! ======
//! The app keeps exactly two kinds of local state: the "remember session"
//! flag and the cached user object. Both are plain strings behind the
//! `FlagStore` trait, so the session glue neither knows nor cares whether
//! they live in memory (tests) or in a JSON file next to the binary.
//! Writes are best-effort: a failed disk write logs and keeps the cached
//! value, it never fails the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

/// Persisted string key/value pairs for session flags.
pub trait FlagStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryFlagStore(Mutex<HashMap<String, String>>);

impl MemoryFlagStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let mut map = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(key);
    }
}

// =============================================================================
// FILE
// =============================================================================

/// JSON-file-backed store used by the terminal client.
pub struct FileFlagStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileFlagStore {
    /// Open the store, loading any existing file. A missing or unreadable
    /// file starts empty.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self { path, cache: Mutex::new(cache) }
    }

    fn persist(&self, map: &HashMap<String, String>) {
        let json = match serde_json::to_string_pretty(map) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "flag store serialize failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!(error = %e, path = %self.path.display(), "flag store write failed");
        }
    }
}

impl FlagStore for FileFlagStore {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(key.to_string(), value.to_string());
        self.persist(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(key);
        self.persist(&map);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryFlagStore::new();
        assert_eq!(store.get("remember_session"), None);

        store.set("remember_session", "true");
        assert_eq!(store.get("remember_session").as_deref(), Some("true"));

        store.remove("remember_session");
        assert_eq!(store.get("remember_session"), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("recetario-prefs-{}.json", uuid::Uuid::new_v4()));

        let store = FileFlagStore::open(&path);
        store.set("cached_user", r#"{"email":"ana@example.com"}"#);
        drop(store);

        let reopened = FileFlagStore::open(&path);
        assert_eq!(
            reopened.get("cached_user").as_deref(),
            Some(r#"{"email":"ana@example.com"}"#)
        );
        reopened.remove("cached_user");
        assert_eq!(reopened.get("cached_user"), None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_store_tolerates_garbage_file() {
        let path = std::env::temp_dir().join(format!("recetario-prefs-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "not json at all").unwrap();

        let store = FileFlagStore::open(&path);
        assert_eq!(store.get("anything"), None);

        let _ = std::fs::remove_file(&path);
    }
}
