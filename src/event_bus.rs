// =============================================================================
// EventBus — pub/sub fan-out to dashboard and other WebSocket subscribers
// =============================================================================
//
// A fixed channel map, timeout-protected concurrent sends, and eviction of
// subscribers that fail or time out. Publishers never learn which
// subscribers dropped off.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::BusDeliveryError;
use crate::models::{Order, Trade};
use crate::types::Channel;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that can receive a published event. A WebSocket connection
/// implements this by forwarding the serialized envelope to its client.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> Uuid;
    async fn send(&self, envelope: &Envelope) -> Result<(), BusDeliveryError>;
    /// Current liveness of the underlying transport. A subscriber observed
    /// as anything other than `Connected` is evicted the next time it would
    /// receive a publish, without waiting for a send to fail or time out.
    fn state(&self) -> SubscriberState {
        SubscriberState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PositionUpdate { order: Order },
    TradeSignal { symbol: Option<String>, action: String, reason: Option<String> },
    OrderExecuted { order: Order },
    PositionClosed { trade: Trade },
    SessionUpdate { kind: String, detail: serde_json::Value },
    Error { message: String },
    Heartbeat { connections: usize },
    PositionsCount { count: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub channel: Channel,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStatistics {
    pub subscriber_counts: HashMap<String, usize>,
}

/// Fixed channel lexicon pub/sub. Every subscriber that joins any specific
/// channel is also mirrored into `All`; a subscriber appears at most once
/// per channel.
pub struct EventBus {
    channels: RwLock<HashMap<Channel, Vec<Arc<dyn Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        for c in Channel::ALL {
            channels.insert(c, Vec::new());
        }
        Self {
            channels: RwLock::new(channels),
        }
    }

    /// Adds `subscriber` to `channel`, and to `All` if `channel` is not
    /// already `All`. A no-op if the subscriber is already present in a
    /// channel (by id).
    pub async fn subscribe(&self, channel: Channel, subscriber: Arc<dyn Subscriber>) {
        let mut guard = self.channels.write().await;
        Self::insert_once(&mut guard, channel, subscriber.clone());
        if channel != Channel::All {
            Self::insert_once(&mut guard, Channel::All, subscriber);
        }
    }

    fn insert_once(
        channels: &mut HashMap<Channel, Vec<Arc<dyn Subscriber>>>,
        channel: Channel,
        subscriber: Arc<dyn Subscriber>,
    ) {
        let list = channels.entry(channel).or_default();
        if !list.iter().any(|s| s.id() == subscriber.id()) {
            list.push(subscriber);
        }
    }

    /// Removes a subscriber from every channel it belongs to.
    pub async fn unsubscribe(&self, id: Uuid) {
        let mut guard = self.channels.write().await;
        for list in guard.values_mut() {
            list.retain(|s| s.id() != id);
        }
    }

    /// Removes a subscriber from `channel` only (and from `All` if `channel`
    /// is itself `All`). Used by the per-connection subscription protocol,
    /// where a client can drop one channel without closing the socket.
    pub async fn unsubscribe_from(&self, id: Uuid, channel: Channel) {
        let mut guard = self.channels.write().await;
        if let Some(list) = guard.get_mut(&channel) {
            list.retain(|s| s.id() != id);
        }
    }

    /// Publishes `event` to `channel`, sending to every subscriber
    /// concurrently with a 5-second deadline each. Subscribers that fail or
    /// time out are evicted; the publisher is never informed of either.
    /// Bounded by `5s × fanout` in the worst case (every send timing out
    /// sequentially would be `5s × fanout`; concurrent sends bound it by
    /// `5s` plus join overhead).
    pub async fn publish(&self, channel: Channel, event: EventKind) {
        let envelope = Envelope {
            channel,
            timestamp: Utc::now(),
            event,
        };

        let subscribers = {
            let guard = self.channels.read().await;
            guard.get(&channel).cloned().unwrap_or_default()
        };
        if subscribers.is_empty() {
            return;
        }

        let mut set = tokio::task::JoinSet::new();
        for subscriber in subscribers {
            let envelope = envelope.clone();
            set.spawn(async move {
                let id = subscriber.id();
                if subscriber.state() != SubscriberState::Connected {
                    warn!(subscriber = %id, "subscriber no longer connected, evicting");
                    return Some(id);
                }
                let result = tokio::time::timeout(SEND_TIMEOUT, subscriber.send(&envelope)).await;
                match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        warn!(subscriber = %id, error = %e, "subscriber send failed, evicting");
                        Some(id)
                    }
                    Err(_) => {
                        warn!(subscriber = %id, "subscriber send timed out, evicting");
                        Some(id)
                    }
                }
            });
        }

        let mut dead = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(id)) = joined {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut guard = self.channels.write().await;
            for list in guard.values_mut() {
                list.retain(|s| !dead.contains(&s.id()));
            }
        }
    }

    pub async fn publish_position_update(&self, order: &Order, channels: &[Channel]) {
        for &c in channels {
            self.publish(c, EventKind::PositionUpdate { order: order.clone() })
                .await;
        }
    }

    pub async fn publish_trade_signal(
        &self,
        symbol: Option<String>,
        action: &str,
        reason: Option<String>,
        channels: &[Channel],
    ) {
        for &c in channels {
            self.publish(
                c,
                EventKind::TradeSignal {
                    symbol: symbol.clone(),
                    action: action.to_string(),
                    reason: reason.clone(),
                },
            )
            .await;
        }
    }

    pub async fn publish_order_executed(&self, order: &Order, channels: &[Channel]) {
        for &c in channels {
            self.publish(c, EventKind::OrderExecuted { order: order.clone() })
                .await;
        }
    }

    pub async fn publish_position_closed(&self, trade: &Trade, channels: &[Channel]) {
        for &c in channels {
            self.publish(c, EventKind::PositionClosed { trade: trade.clone() })
                .await;
        }
    }

    pub async fn publish_session_update(&self, kind: &str, detail: serde_json::Value) {
        self.publish(
            Channel::Sessions,
            EventKind::SessionUpdate {
                kind: kind.to_string(),
                detail,
            },
        )
        .await;
    }

    pub async fn publish_error(&self, message: String, channels: &[Channel]) {
        for &c in channels {
            self.publish(c, EventKind::Error { message: message.clone() }).await;
        }
    }

    pub async fn heartbeat(&self) {
        let connections = {
            let guard = self.channels.read().await;
            guard.get(&Channel::All).map(|list| list.len()).unwrap_or(0)
        };
        self.publish(Channel::All, EventKind::Heartbeat { connections }).await;
    }

    /// Reports the number of open positions across all accounts after a
    /// reconciliation pass.
    pub async fn publish_positions_count(&self, count: usize, channels: &[Channel]) {
        for &c in channels {
            self.publish(c, EventKind::PositionsCount { count }).await;
        }
    }

    pub async fn statistics(&self) -> BusStatistics {
        let guard = self.channels.read().await;
        let subscriber_counts = guard
            .iter()
            .map(|(c, list)| (c.as_str().to_string(), list.len()))
            .collect();
        BusStatistics { subscriber_counts }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
