//! Typing presence — aggregation of inbound signals, debounce of outbound.
//!
//! DESIGN
//! ======
//! There is no "stopped typing" event anywhere in the system. A client
//! emits an insert into the typing log while its user is actively editing,
//! and every peer infers "stopped" purely from silence: an entry whose last
//! signal is older than the inactivity threshold is evicted by a periodic
//! sweep. The sender's debounce window (1.5 s) is deliberately shorter than
//! the receiver's eviction threshold (3 s) so the indicator does not
//! flicker off between keystrokes under normal network latency.
//!
//! TRADE-OFFS
//! ==========
//! Silence conflates "stopped typing" with "signal lost in transit". That
//! is the wire contract deployed peers rely on; inventing an explicit stop
//! signal here would break interoperability with them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{DataApi, EventFeed, FeedError};
use crate::event::Data;

use super::WatchHandle;

/// Append-only log of typing signals, one row per keystroke burst.
pub const TYPING_TABLE: &str = "escribiendo";

/// An entry is stale once this long has passed since its last signal.
const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(3);

/// How often stale entries are swept out.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Sender-side debounce window. Shorter than `INACTIVITY_THRESHOLD`.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(1500);

// =============================================================================
// PRESENCE SET
// =============================================================================

/// The set of users currently considered "typing", by local inference.
///
/// Time is always passed in explicitly so eviction is testable without
/// sleeping; the subscription task feeds it `Instant::now()`.
#[derive(Default)]
pub struct PresenceSet {
    last_seen: HashMap<Uuid, Instant>,
}

impl PresenceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing signal. Returns `true` only when membership changed,
    /// i.e. the user was not already present — a timestamp refresh of a
    /// present user is not a reportable change.
    pub fn note_event_at(&mut self, user_id: Uuid, now: Instant) -> bool {
        self.last_seen.insert(user_id, now).is_none()
    }

    /// Evict every entry stale at `now`. Returns `true` when anything was
    /// evicted. After a sweep, every remaining entry is younger than the
    /// inactivity threshold.
    pub fn sweep_at(&mut self, now: Instant) -> bool {
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.duration_since(*seen) < INACTIVITY_THRESHOLD);
        self.last_seen.len() != before
    }

    /// Current members, sorted for stable presentation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.last_seen.keys().copied().collect();
        users.sort_unstable();
        users
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

// =============================================================================
// AGGREGATOR
// =============================================================================

/// Subscribe to the typing log and report membership changes.
///
/// One consumer task multiplexes inbound insert-events with the periodic
/// sweep; `on_change` fires with the full sorted member list whenever the
/// set gains or loses a user — never on a mere refresh.
///
/// # Errors
///
/// Returns `AlreadySubscribed` while a previous typing watch on this feed
/// is still live.
pub async fn watch_typing<F>(feed: &dyn EventFeed, on_change: F) -> Result<WatchHandle, FeedError>
where
    F: Fn(Vec<Uuid>) + Send + 'static,
{
    let sub = feed.subscribe(TYPING_TABLE).await?;
    let status = sub.status.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        // Bind the whole subscription so the task owns it (including its
        // table claim) for its entire lifetime; referencing only `sub.events`
        // would let disjoint capture drop the rest of `sub` immediately.
        let mut sub = sub;
        let mut presence = PresenceSet::new();
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                maybe_event = sub.events.recv() => {
                    // Channel end means the transport is done; the status
                    // watch already carries Closed or Failed.
                    let Some(event) = maybe_event else { break };
                    let Some(user_id) = event.uuid_field("author_id") else {
                        debug!(table = %event.table, "typing event without author_id");
                        continue;
                    };
                    if presence.note_event_at(user_id, Instant::now()) {
                        on_change(presence.snapshot());
                    }
                }
                _ = sweep.tick() => {
                    if presence.sweep_at(Instant::now()) {
                        on_change(presence.snapshot());
                    }
                }
            }
        }
        // Presence state and the feed subscription drop with the task.
    });

    Ok(WatchHandle::new(shutdown_tx, task, status))
}

// =============================================================================
// DEBOUNCE EMITTER
// =============================================================================

/// Rate-limits the local user's keystrokes into outbound typing signals.
///
/// One signal is kept in flight at a time; repeated bursts may emit again
/// once the previous insert resolves. The debounce timer is inert upstream:
/// when it lapses it only clears the local typing flag — peers expire the
/// entry through their own sweep.
pub struct TypingEmitter {
    api: Arc<dyn DataApi>,
    user_id: Uuid,
    in_flight: Arc<AtomicBool>,
    typing_local: Arc<AtomicBool>,
    debounce: Option<JoinHandle<()>>,
    emit: Option<JoinHandle<()>>,
}

impl TypingEmitter {
    #[must_use]
    pub fn new(api: Arc<dyn DataApi>, user_id: Uuid) -> Self {
        Self {
            api,
            user_id,
            in_flight: Arc::new(AtomicBool::new(false)),
            typing_local: Arc::new(AtomicBool::new(false)),
            debounce: None,
            emit: None,
        }
    }

    /// React to a character-level change of the input buffer.
    ///
    /// Non-empty buffer: emit a typing signal unless one is in flight, and
    /// reset the debounce timer. Empty buffer: cancel the timer only —
    /// peers are not notified of a stop.
    pub fn keystroke(&mut self, buffer: &str) {
        if buffer.is_empty() {
            self.cancel();
            return;
        }

        if !self.in_flight.swap(true, Ordering::SeqCst) {
            let api = Arc::clone(&self.api);
            let in_flight = Arc::clone(&self.in_flight);
            let user_id = self.user_id;
            self.emit = Some(tokio::spawn(async move {
                let mut row = Data::new();
                row.insert("author_id".into(), serde_json::json!(user_id.to_string()));
                if let Err(e) = api.insert(TYPING_TABLE, row).await {
                    // Best-effort signal; a lost one just delays the indicator.
                    debug!(error = %e, "typing signal insert failed");
                }
                in_flight.store(false, Ordering::SeqCst);
            }));
        }

        self.typing_local.store(true, Ordering::SeqCst);
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
        let typing_local = Arc::clone(&self.typing_local);
        self.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_DELAY).await;
            typing_local.store(false, Ordering::SeqCst);
        }));
    }

    /// The buffer was submitted as a message; stop the pending timer.
    pub fn submitted(&mut self) {
        self.cancel();
    }

    /// Local "am I typing" flag, as last known to this emitter.
    #[must_use]
    pub fn is_typing(&self) -> bool {
        self.typing_local.load(Ordering::SeqCst)
    }

    fn cancel(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
        self.typing_local.store(false, Ordering::SeqCst);
    }
}

impl Drop for TypingEmitter {
    fn drop(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
        if let Some(emit) = self.emit.take() {
            emit.abort();
        }
    }
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
