//! Domain services over the backend contracts.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the client-side business logic: session glue, the
//! chat message relay, typing-presence aggregation, and recipe CRUD. Each
//! is constructed with the backend clients it needs and nothing else.
//!
//! Subscriptions share one lifecycle shape: `watch_*` subscribes to a
//! table's feed, spawns a single consumer task, and returns a
//! `WatchHandle`. The task owns all per-subscription state, so teardown is
//! simply ending the task — nothing else can touch that state afterwards.

pub mod auth;
pub mod chat;
pub mod recipes;
pub mod typing;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::backend::FeedStatus;

// =============================================================================
// WATCH HANDLE
// =============================================================================

/// Handle to a live feed subscription task.
///
/// `unsubscribe` stops the consumer task deterministically: by the time it
/// returns, the timer is gone, the feed subscription is released, and the
/// callback can no longer fire. Repeat calls are no-ops. Dropping the
/// handle without unsubscribing aborts the task — a subscription never
/// outlives its owner.
pub struct WatchHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    status: watch::Receiver<FeedStatus>,
}

impl WatchHandle {
    pub(crate) fn new(
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
        status: watch::Receiver<FeedStatus>,
    ) -> Self {
        Self { shutdown: Some(shutdown), task: Some(task), status }
    }

    /// Tear down the subscription. Idempotent.
    pub async fn unsubscribe(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Last observed connection state of the underlying feed.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        *self.status.borrow()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
