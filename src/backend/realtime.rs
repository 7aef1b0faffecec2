//! Realtime feed transport — websocket subscription to table insert-events.
//!
//! DESIGN
//! ======
//! Each `subscribe` spawns one transport task that owns the socket: it joins
//! the table's topic, decodes INSERT payloads into `InsertEvent`s, and sends
//! a heartbeat on a fixed interval. Connection state flows to the caller
//! through the subscription's watch channel.
//!
//! LIFECYCLE
//! =========
//! 1. Connect → join topic → `Connected`
//! 2. Pump messages; decoded inserts go to the subscription channel
//! 3. On transport loss: reconnect with jittered exponential back-off,
//!    up to `reconnect_attempts` consecutive failures, then `Failed`
//! 4. On clean server close: `Closed` (the caller decides whether to
//!    resubscribe — the subscription itself is finished)
//! 5. Subscriber drop ends the task at the next send or reconnect check

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};

use crate::event::{Data, InsertEvent};

use super::config::FeedConfig;
use super::{ActiveTables, EventFeed, FeedError, FeedStatus, FeedSubscription};

pub struct RealtimeFeed {
    url: String,
    config: FeedConfig,
    active: ActiveTables,
}

impl RealtimeFeed {
    /// `url` is the full websocket endpoint (see `BackendConfig::realtime_url`).
    #[must_use]
    pub fn new(url: impl Into<String>, config: FeedConfig) -> Self {
        Self { url: url.into(), config, active: ActiveTables::default() }
    }
}

#[async_trait]
impl EventFeed for RealtimeFeed {
    async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError> {
        let claim = self.active.claim(table)?;
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);

        tokio::spawn(feed_task(self.url.clone(), table.to_string(), self.config, event_tx, status_tx));

        Ok(FeedSubscription::new(event_rx, status_rx, claim))
    }
}

// =============================================================================
// TRANSPORT TASK
// =============================================================================

enum PumpEnd {
    /// Server closed the stream cleanly.
    ServerClosed,
    /// The subscription receiver was dropped; nobody is listening.
    SubscriberGone,
    /// Transport error mid-stream; candidate for reconnect.
    Lost(String),
}

async fn feed_task(
    url: String,
    table: String,
    config: FeedConfig,
    event_tx: mpsc::Sender<InsertEvent>,
    status_tx: watch::Sender<FeedStatus>,
) {
    let mut failures: usize = 0;
    let mut backoff = config.reconnect_base;

    loop {
        let _ = status_tx.send(FeedStatus::Connecting);

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                failures = 0;
                backoff = config.reconnect_base;
                match pump(socket, &table, config, &event_tx, &status_tx).await {
                    PumpEnd::ServerClosed => {
                        info!(%table, "feed closed by server");
                        let _ = status_tx.send(FeedStatus::Closed);
                        return;
                    }
                    PumpEnd::SubscriberGone => return,
                    PumpEnd::Lost(reason) => {
                        warn!(%table, %reason, "feed connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(%table, error = %e, "feed connect failed");
            }
        }

        if event_tx.is_closed() {
            return;
        }
        failures += 1;
        if failures >= config.reconnect_attempts {
            warn!(%table, failures, "feed giving up; marking subscription failed");
            let _ = status_tx.send(FeedStatus::Failed);
            return;
        }
        tokio::time::sleep(with_jitter(backoff)).await;
        backoff = backoff.saturating_mul(2).min(config.reconnect_max);
    }
}

async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    table: &str,
    config: FeedConfig,
    event_tx: &mpsc::Sender<InsertEvent>,
    status_tx: &watch::Sender<FeedStatus>,
) -> PumpEnd {
    let (mut sink, mut stream) = socket.split();
    let mut reference: u64 = 1;

    if sink.send(Message::text(join_message(table, reference))).await.is_err() {
        return PumpEnd::Lost("topic join send failed".into());
    }
    let _ = status_tx.send(FeedStatus::Connected);
    info!(%table, "feed subscribed");

    let mut heartbeat = tokio::time::interval(config.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Consume the immediate first tick; the join just went out.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = decode_insert(table, text.as_str()) {
                        if event_tx.send(event).await.is_err() {
                            return PumpEnd::SubscriberGone;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return PumpEnd::ServerClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
            },
            _ = heartbeat.tick() => {
                reference += 1;
                if sink.send(Message::text(heartbeat_message(reference))).await.is_err() {
                    return PumpEnd::Lost("heartbeat send failed".into());
                }
            }
        }
    }
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

fn topic(table: &str) -> String {
    format!("realtime:public:{table}")
}

fn join_message(table: &str, reference: u64) -> String {
    serde_json::json!({
        "topic": topic(table),
        "event": "phx_join",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

fn heartbeat_message(reference: u64) -> String {
    serde_json::json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

/// Decode one inbound text frame into an insert-event for `table`.
/// Anything else (acks, heartbeat replies, other topics) decodes to `None`.
pub(crate) fn decode_insert(table: &str, text: &str) -> Option<InsertEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("topic")?.as_str()? != topic(table) {
        return None;
    }
    if value.get("event")?.as_str()? != "INSERT" {
        return None;
    }
    let record = value.get("payload")?.get("record")?.as_object()?;
    let record: Data = record.clone().into_iter().collect();
    Some(InsertEvent::new(table, record))
}

fn with_jitter(base: Duration) -> Duration {
    let quarter = u64::try_from(base.as_millis() / 4).unwrap_or(0);
    let jitter = rand::rng().random_range(0..=quarter);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
