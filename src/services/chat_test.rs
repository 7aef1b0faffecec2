use std::sync::Mutex;
use std::time::Duration;

use super::*;
use crate::backend::memory::MemoryBackend;
use crate::services::auth::test_helpers::signed_in_handle;

fn relay(backend: &Arc<MemoryBackend>, session: SessionHandle) -> MessageRelay {
    MessageRelay::new(backend.clone(), backend.clone(), session)
}

fn seed_message(backend: &MemoryBackend, content: &str, author_id: Uuid, created_at: &str) -> Uuid {
    let id = Uuid::new_v4();
    let mut row = Data::new();
    row.insert("id".into(), serde_json::json!(id.to_string()));
    row.insert("content".into(), serde_json::json!(content));
    row.insert("author_id".into(), serde_json::json!(author_id.to_string()));
    row.insert("created_at".into(), serde_json::json!(created_at));
    backend.seed_row(MESSAGES_TABLE, row);
    id
}

fn event_record(id: Uuid, content: &str, author_id: Uuid) -> Data {
    let mut record = Data::new();
    record.insert("id".into(), serde_json::json!(id.to_string()));
    record.insert("content".into(), serde_json::json!(content));
    record.insert("author_id".into(), serde_json::json!(author_id.to_string()));
    record
}

/// Capture `on_insert` messages for assertion.
fn capture() -> (Arc<Mutex<Vec<ChatMessage>>>, impl Fn(ChatMessage) + Send + 'static) {
    let seen: Arc<Mutex<Vec<ChatMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |message| sink.lock().unwrap().push(message))
}

// =============================================================================
// FROM_ROW
// =============================================================================

#[test]
fn from_row_parses_enriched_row() {
    let author_id = Uuid::new_v4();
    let mut row = event_record(Uuid::new_v4(), "hola", author_id);
    row.insert("created_at".into(), serde_json::json!("2026-03-01T10:00:00Z"));
    row.insert(
        "usuarios".into(),
        serde_json::json!({ "email": "ana@example.com", "rol": "admin" }),
    );

    let message = ChatMessage::from_row(&row).expect("message");
    assert_eq!(message.content, "hola");
    assert_eq!(message.author_id, author_id);
    assert_eq!(message.created_at.year(), 2026);
    assert_eq!(message.author, Author { email: "ana@example.com".into(), rol: "admin".into() });
}

#[test]
fn from_row_degrades_partial_rows() {
    let id = Uuid::new_v4();
    let mut row = Data::new();
    row.insert("id".into(), serde_json::json!(id.to_string()));

    let message = ChatMessage::from_row(&row).expect("partial message");
    assert_eq!(message.id, id);
    assert_eq!(message.content, "");
    assert_eq!(message.author_id, Uuid::nil());
    assert_eq!(message.author, Author::desconocido());
}

#[test]
fn from_row_requires_id() {
    let mut row = Data::new();
    row.insert("content".into(), serde_json::json!("sin id"));
    assert!(ChatMessage::from_row(&row).is_none());
}

#[test]
fn message_serde_round_trip() {
    let mut row = event_record(Uuid::new_v4(), "hola", Uuid::new_v4());
    row.insert("created_at".into(), serde_json::json!("2026-03-01T10:00:00Z"));
    let original = ChatMessage::from_row(&row).unwrap();

    let json = serde_json::to_string(&original).expect("serialize");
    let restored: ChatMessage = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored.id, original.id);
    assert_eq!(restored.created_at, original.created_at);
}

// =============================================================================
// FETCH / SEND / DELETE
// =============================================================================

#[tokio::test]
async fn fetch_recent_is_oldest_first_within_limit() {
    let backend = Arc::new(MemoryBackend::new());
    let author = Uuid::new_v4();
    seed_message(&backend, "primero", author, "2026-03-01T10:00:00Z");
    seed_message(&backend, "segundo", author, "2026-03-02T10:00:00Z");
    seed_message(&backend, "tercero", author, "2026-03-03T10:00:00Z");

    let relay = relay(&backend, SessionHandle::default());
    let messages = relay.fetch_recent(2).await.unwrap();

    // The two newest, in ascending creation order.
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["segundo", "tercero"]);
}

#[tokio::test]
async fn send_blank_content_is_rejected_without_insert() {
    let backend = Arc::new(MemoryBackend::new());
    let relay = relay(&backend, signed_in_handle(Uuid::new_v4()));

    assert!(matches!(relay.send("").await, Err(ChatError::EmptyContent)));
    assert!(matches!(relay.send("   ").await, Err(ChatError::EmptyContent)));
    assert_eq!(backend.insert_count(MESSAGES_TABLE), 0);
}

#[tokio::test]
async fn send_without_session_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let relay = relay(&backend, SessionHandle::default());

    assert!(matches!(relay.send("hola").await, Err(ChatError::Unauthenticated)));
    assert_eq!(backend.insert_count(MESSAGES_TABLE), 0);
}

#[tokio::test]
async fn send_inserts_trimmed_content_with_author() {
    let backend = Arc::new(MemoryBackend::new());
    let user_id = Uuid::new_v4();
    let relay = relay(&backend, signed_in_handle(user_id));

    relay.send("  hola a todos  ").await.unwrap();

    let rows = backend.rows(MESSAGES_TABLE);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("content").and_then(|v| v.as_str()), Some("hola a todos"));
    assert_eq!(
        rows[0].get("author_id").and_then(|v| v.as_str()),
        Some(user_id.to_string().as_str())
    );
}

#[tokio::test]
async fn delete_removes_row() {
    let backend = Arc::new(MemoryBackend::new());
    let id = seed_message(&backend, "fuera", Uuid::new_v4(), "2026-03-01T10:00:00Z");
    let relay = relay(&backend, signed_in_handle(Uuid::new_v4()));

    relay.delete(id).await.unwrap();
    assert!(backend.rows(MESSAGES_TABLE).is_empty());
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn watch_enriches_inbound_events() {
    let backend = Arc::new(MemoryBackend::new());
    let author = backend.register_user("ana@example.com", "secreta", "admin");
    let relay = relay(&backend, signed_in_handle(author));

    let (seen, on_insert) = capture();
    let mut handle = relay.watch(on_insert).await.unwrap();

    // The sender relies on the subscription echo, not the insert response.
    relay.send("hola").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = seen.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hola");
    assert_eq!(messages[0].author, Author { email: "ana@example.com".into(), rol: "admin".into() });
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn enrichment_failure_degrades_to_placeholder() {
    let backend = Arc::new(MemoryBackend::new());
    let relay = relay(&backend, SessionHandle::default());

    let (seen, on_insert) = capture();
    let mut handle = relay.watch(on_insert).await.unwrap();

    backend.fail_next_fetch();
    backend.push_event(MESSAGES_TABLE, event_record(Uuid::new_v4(), "llego igual", Uuid::new_v4()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The event is never dropped; the author degrades to the placeholder.
    let messages = seen.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "llego igual");
    assert_eq!(messages[0].author, Author::desconocido());
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_events_fetch_twice_and_dedupe_at_the_caller() {
    let backend = Arc::new(MemoryBackend::new());
    let author = Uuid::new_v4();
    let id = seed_message(&backend, "repetido", author, "2026-03-01T10:00:00Z");
    let relay = relay(&backend, SessionHandle::default());

    let (seen, on_insert) = capture();
    let mut handle = relay.watch(on_insert).await.unwrap();

    // The same payload delivered twice produces two enrichment fetches and
    // two callbacks — the relay does not dedupe.
    backend.push_event(MESSAGES_TABLE, event_record(id, "repetido", author));
    backend.push_event(MESSAGES_TABLE, event_record(id, "repetido", author));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = seen.lock().unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(backend.fetch_count(), 2);

    // Caller-level de-duplication keeps the message once.
    let mut log = MessageLog::new();
    assert!(log.insert_unique(messages[0].clone()));
    assert!(!log.insert_unique(messages[1].clone()));
    assert_eq!(log.len(), 1);
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn events_without_id_are_skipped() {
    let backend = Arc::new(MemoryBackend::new());
    let relay = relay(&backend, SessionHandle::default());

    let (seen, on_insert) = capture();
    let mut handle = relay.watch(on_insert).await.unwrap();

    let mut record = Data::new();
    record.insert("content".into(), serde_json::json!("sin id"));
    backend.push_event(MESSAGES_TABLE, record);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(seen.lock().unwrap().is_empty());
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_watch_ignores_late_events() {
    let backend = Arc::new(MemoryBackend::new());
    let relay = relay(&backend, SessionHandle::default());

    let (seen, on_insert) = capture();
    let mut handle = relay.watch(on_insert).await.unwrap();
    handle.unsubscribe().await;

    backend.push_event(MESSAGES_TABLE, event_record(Uuid::new_v4(), "tarde", Uuid::new_v4()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(seen.lock().unwrap().is_empty());
    // Repeat unsubscribe is a no-op.
    handle.unsubscribe().await;
}

// =============================================================================
// MESSAGE LOG
// =============================================================================

#[test]
fn message_log_replace_remove_and_dedupe() {
    let author = Uuid::new_v4();
    let mut row = event_record(Uuid::new_v4(), "historia", author);
    row.insert("created_at".into(), serde_json::json!("2026-03-01T10:00:00Z"));
    let history = ChatMessage::from_row(&row).unwrap();

    let mut log = MessageLog::new();
    log.replace_history(vec![history.clone()]);
    assert_eq!(log.len(), 1);

    // The echo of a history row is ignored by id.
    assert!(!log.insert_unique(history.clone()));

    log.remove(history.id);
    assert!(log.is_empty());
}
