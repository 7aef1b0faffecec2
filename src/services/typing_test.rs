use std::sync::Mutex;

use super::*;
use crate::backend::FeedStatus;
use crate::backend::memory::MemoryBackend;

fn signal_record(user_id: Uuid) -> Data {
    let mut record = Data::new();
    record.insert("author_id".into(), serde_json::json!(user_id.to_string()));
    record
}

/// Capture `on_change` snapshots for assertion.
fn capture() -> (Arc<Mutex<Vec<Vec<Uuid>>>>, impl Fn(Vec<Uuid>) + Send + 'static) {
    let seen: Arc<Mutex<Vec<Vec<Uuid>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |snapshot| sink.lock().unwrap().push(snapshot))
}

// =============================================================================
// PRESENCE SET
// =============================================================================

#[test]
fn note_event_reports_membership_change_only() {
    let mut presence = PresenceSet::new();
    let user = Uuid::new_v4();
    let now = Instant::now();

    assert!(presence.note_event_at(user, now));
    // A refresh bumps the timestamp but is not a membership change.
    assert!(!presence.note_event_at(user, now + Duration::from_millis(500)));
    assert_eq!(presence.len(), 1);
}

#[test]
fn sweep_evicts_only_stale_entries() {
    let mut presence = PresenceSet::new();
    let stale = Uuid::new_v4();
    let fresh = Uuid::new_v4();
    let start = Instant::now();

    presence.note_event_at(stale, start);
    presence.note_event_at(fresh, start + Duration::from_secs(4));

    assert!(presence.sweep_at(start + Duration::from_secs(5)));
    assert_eq!(presence.snapshot(), vec![fresh]);

    // Nothing else is stale; a second sweep changes nothing.
    assert!(!presence.sweep_at(start + Duration::from_secs(5)));
}

#[test]
fn silence_evicts_after_threshold() {
    // User A signals at t=0, t=1.0s, t=2.0s, then goes silent. A sweep at
    // t=5.0s is past the 3s-from-last-event threshold and must evict.
    let mut presence = PresenceSet::new();
    let user = Uuid::new_v4();
    let start = Instant::now();

    assert!(presence.note_event_at(user, start));
    assert!(!presence.note_event_at(user, start + Duration::from_secs(1)));
    assert!(!presence.note_event_at(user, start + Duration::from_secs(2)));

    // Within the threshold of the last signal: still present.
    assert!(!presence.sweep_at(start + Duration::from_millis(2500)));
    assert_eq!(presence.len(), 1);

    assert!(presence.sweep_at(start + Duration::from_secs(5)));
    assert!(presence.is_empty());
    assert!(presence.snapshot().is_empty());
}

#[test]
fn no_member_older_than_threshold_survives_a_sweep() {
    let mut presence = PresenceSet::new();
    let start = Instant::now();
    let users: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

    for (i, user) in users.iter().enumerate() {
        presence.note_event_at(*user, start + Duration::from_millis(700 * i as u64));
    }

    let sweep_time = start + Duration::from_secs(6);
    presence.sweep_at(sweep_time);
    for user in presence.snapshot() {
        let seen = *presence.last_seen.get(&user).unwrap();
        assert!(sweep_time.duration_since(seen) < Duration::from_secs(3));
    }
}

#[test]
fn snapshot_is_sorted() {
    let mut presence = PresenceSet::new();
    let now = Instant::now();
    for _ in 0..5 {
        presence.note_event_at(Uuid::new_v4(), now);
    }

    let snapshot = presence.snapshot();
    let mut sorted = snapshot.clone();
    sorted.sort_unstable();
    assert_eq!(snapshot, sorted);
}

// =============================================================================
// AGGREGATOR
// =============================================================================

#[tokio::test(start_paused = true)]
async fn watch_reports_new_member() {
    let backend = Arc::new(MemoryBackend::new());
    let (seen, on_change) = capture();
    let mut handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    let user = Uuid::new_v4();
    backend.push_event(TYPING_TABLE, signal_record(user));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock().unwrap(), vec![vec![user]]);
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_does_not_fire_callback() {
    let backend = Arc::new(MemoryBackend::new());
    let (seen, on_change) = capture();
    let mut handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    let user = Uuid::new_v4();
    backend.push_event(TYPING_TABLE, signal_record(user));
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.push_event(TYPING_TABLE, signal_record(user));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One membership change, one callback — the refresh stays silent.
    assert_eq!(seen.lock().unwrap().len(), 1);
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_silent_member_and_reports_empty_set() {
    let backend = Arc::new(MemoryBackend::new());
    let (seen, on_change) = capture();
    let mut handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    let user = Uuid::new_v4();
    backend.push_event(TYPING_TABLE, signal_record(user));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Let the 1s sweep pass the 3s inactivity threshold.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshots = seen.lock().unwrap().clone();
    assert_eq!(snapshots.first(), Some(&vec![user]));
    assert_eq!(snapshots.last(), Some(&Vec::new()));
    assert_eq!(snapshots.len(), 2);
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn events_without_author_are_ignored() {
    let backend = Arc::new(MemoryBackend::new());
    let (seen, on_change) = capture();
    let mut handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    backend.push_event(TYPING_TABLE, Data::new());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(seen.lock().unwrap().is_empty());
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_detaches_callback_and_is_idempotent() {
    let backend = Arc::new(MemoryBackend::new());
    let (seen, on_change) = capture();
    let mut handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    handle.unsubscribe().await;

    // A synthetic event delivered after teardown must not panic and must
    // not reach the detached callback.
    backend.push_event(TYPING_TABLE, signal_record(Uuid::new_v4()));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(seen.lock().unwrap().is_empty());

    // Repeat unsubscribe is a no-op.
    handle.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn second_watch_refused_while_first_is_live() {
    let backend = Arc::new(MemoryBackend::new());
    let (_seen, on_change) = capture();
    let mut handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    let result = watch_typing(backend.as_ref(), |_| {}).await;
    assert!(matches!(result, Err(FeedError::AlreadySubscribed(t)) if t == TYPING_TABLE));

    // After teardown the slot is free again.
    handle.unsubscribe().await;
    let mut second = watch_typing(backend.as_ref(), |_| {}).await.unwrap();
    second.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn feed_close_surfaces_through_status() {
    let backend = Arc::new(MemoryBackend::new());
    let (_seen, on_change) = capture();
    let handle = watch_typing(backend.as_ref(), on_change).await.unwrap();

    backend.close_feed(TYPING_TABLE);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handle.status(), FeedStatus::Closed);
}

// =============================================================================
// DEBOUNCE EMITTER
// =============================================================================

#[tokio::test(start_paused = true)]
async fn emitter_keeps_one_signal_in_flight() {
    let backend = Arc::new(MemoryBackend::new());
    let mut emitter = TypingEmitter::new(backend.clone(), Uuid::new_v4());

    // Two keystrokes before the first insert resolves: one signal.
    emitter.keystroke("h");
    emitter.keystroke("ho");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.insert_count(TYPING_TABLE), 1);

    // Once resolved, a later burst may emit again.
    emitter.keystroke("hol");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.insert_count(TYPING_TABLE), 2);
}

#[tokio::test(start_paused = true)]
async fn debounce_timer_resets_on_keystroke_and_lapses_quietly() {
    let backend = Arc::new(MemoryBackend::new());
    let mut emitter = TypingEmitter::new(backend.clone(), Uuid::new_v4());

    emitter.keystroke("h");
    assert!(emitter.is_typing());

    // 1s in, another keystroke resets the 1.5s timer.
    tokio::time::sleep(Duration::from_secs(1)).await;
    emitter.keystroke("ho");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(emitter.is_typing());

    // 1.6s after the last keystroke the timer lapses: the local flag
    // clears, and nothing is emitted upstream.
    let sends_before = backend.insert_count(TYPING_TABLE);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!emitter.is_typing());
    assert_eq!(backend.insert_count(TYPING_TABLE), sends_before);
}

#[tokio::test(start_paused = true)]
async fn submit_and_empty_buffer_cancel_the_timer() {
    let backend = Arc::new(MemoryBackend::new());
    let mut emitter = TypingEmitter::new(backend.clone(), Uuid::new_v4());

    emitter.keystroke("hola");
    emitter.submitted();
    assert!(!emitter.is_typing());

    emitter.keystroke("otra");
    emitter.keystroke("");
    assert!(!emitter.is_typing());

    // Empty-buffer keystrokes never emit.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.insert_count(TYPING_TABLE), 1);
}
