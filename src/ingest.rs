// =============================================================================
// Event Ingest Gateway — push + poll inputs, canonicalised per position
// =============================================================================
//
// Two asynchronous input streams feed the engine:
//
//   * Push — webhook payloads (balance-change and swap-observed categories;
//     everything else is acknowledged and ignored). Redelivery is harmless:
//     the registry's timestamp gating drops stale data.
//   * Poll — one scheduled task per active position looks the price up at a
//     fixed interval. Pollers are independent tasks; a hung lookup for one
//     position never delays another.
//
// Both paths emit canonical `TriggerEvent`s onto the owning position's
// channel via the `EventRouter`. Payloads without a source timestamp are
// stamped with arrival time. Per-position FIFO channel delivery plus registry
// gating gives non-decreasing-timestamp application.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::oracle::PriceSource;
use crate::state::EngineState;
use crate::types::TriggerEvent;

/// Depth of each per-position event channel. Deep enough to absorb webhook
/// bursts while an exit is in flight.
const POSITION_CHANNEL_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Event router
// ---------------------------------------------------------------------------

/// One bounded channel per position. The ingest paths publish; the position's
/// worker consumes. Message passing decouples delivery from processing and
/// keeps per-position ordering trivially FIFO.
pub struct EventRouter {
    senders: RwLock<HashMap<Uuid, mpsc::Sender<TriggerEvent>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for a position and hand back the consuming end.
    pub fn register(&self, position_id: Uuid) -> mpsc::Receiver<TriggerEvent> {
        let (tx, rx) = mpsc::channel(POSITION_CHANNEL_DEPTH);
        self.senders.write().insert(position_id, tx);
        rx
    }

    /// Tear a position's channel down (worker finished).
    pub fn remove(&self, position_id: Uuid) {
        self.senders.write().remove(&position_id);
    }

    /// Publish an event to its position's channel. Returns `false` when the
    /// position has no live worker (closed or never registered).
    pub async fn publish(&self, event: TriggerEvent) -> bool {
        let sender = self.senders.read().get(&event.position_id()).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("channels", &self.senders.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Push path
// ---------------------------------------------------------------------------

/// Raw webhook payload from the push notification source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    /// Notification category; only `balance` and `swap` are consumed.
    pub category: String,
    /// Token mint the notification concerns.
    pub mint: String,
    /// New token balance (balance category).
    #[serde(default)]
    pub amount: Option<f64>,
    /// Observed trade price (swap category).
    #[serde(default)]
    pub price: Option<f64>,
    /// Source timestamp, epoch milliseconds. Stamped with arrival time when
    /// absent.
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

/// Map a push payload onto a canonical event for the active position holding
/// its mint. Returns `None` for ignored categories, unknown mints, or
/// payloads missing their value field.
pub fn canonicalize_push(state: &EngineState, payload: &PushPayload) -> Option<TriggerEvent> {
    let ts = payload.timestamp_ms.unwrap_or_else(now_ms);

    let Some(position_id) = state.registry.find_active_by_mint(&payload.mint) else {
        debug!(mint = %payload.mint, category = %payload.category, "push for unmonitored mint ignored");
        return None;
    };

    match payload.category.as_str() {
        "swap" => match payload.price {
            Some(price) => Some(TriggerEvent::Price {
                position_id,
                price,
                ts,
            }),
            None => {
                warn!(mint = %payload.mint, "swap push without price ignored");
                None
            }
        },
        "balance" => match payload.amount {
            Some(amount) => Some(TriggerEvent::Balance {
                position_id,
                amount,
                ts,
            }),
            None => {
                warn!(mint = %payload.mint, "balance push without amount ignored");
                None
            }
        },
        other => {
            debug!(category = other, mint = %payload.mint, "push category not consumed");
            None
        }
    }
}

/// Current epoch milliseconds, used to stamp events that arrive without a
/// source timestamp.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Poll path
// ---------------------------------------------------------------------------

/// Periodically look up the position's price and publish the observation.
/// Runs as its own Tokio task; tears itself down when the position
/// deactivates or its worker goes away.
pub async fn run_price_poller<O: PriceSource>(
    state: Arc<EngineState>,
    oracle: Arc<O>,
    position_id: Uuid,
    mint: String,
) {
    let poll_secs = state.config.read().poll_interval_secs;
    let mut ticker = interval(Duration::from_secs(poll_secs));

    info!(id = %position_id, mint = %mint, interval_secs = poll_secs, "price poller started");

    loop {
        ticker.tick().await;

        if !state.registry.is_active(position_id) {
            debug!(id = %position_id, "position inactive — poller stopping");
            break;
        }

        match oracle.get_price(&mint).await {
            Ok(quote) => {
                let delivered = state
                    .router
                    .publish(TriggerEvent::Price {
                        position_id,
                        price: quote.price,
                        ts: now_ms(),
                    })
                    .await;
                if !delivered {
                    debug!(id = %position_id, "no worker for position — poller stopping");
                    break;
                }
            }
            Err(e) => {
                // One failed lookup is not fatal; the next tick retries and
                // other positions' pollers are unaffected.
                warn!(id = %position_id, mint = %mint, error = %e, "price lookup failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, LadderRung};
    use crate::registry::ExitThresholds;

    fn thresholds() -> ExitThresholds {
        ExitThresholds {
            stop_loss_price: 0.85,
            emergency_stop_pct: -0.40,
            take_profit_price: 2.0,
            trailing_activation_pct: 0.5,
            trailing_distance: 0.3,
            ladder: vec![LadderRung {
                gain_pct: 0.15,
                sell_fraction: 0.30,
            }],
        }
    }

    fn state_with_position() -> (EngineState, Uuid) {
        let state = EngineState::new(EngineConfig::default());
        let id = state
            .registry
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        (state, id)
    }

    #[test]
    fn swap_push_becomes_price_event() {
        let (state, id) = state_with_position();
        let payload = PushPayload {
            category: "swap".into(),
            mint: "MINT".into(),
            amount: None,
            price: Some(1.25),
            timestamp_ms: Some(777),
        };
        let event = canonicalize_push(&state, &payload).unwrap();
        assert_eq!(
            event,
            TriggerEvent::Price {
                position_id: id,
                price: 1.25,
                ts: 777,
            }
        );
    }

    #[test]
    fn balance_push_becomes_balance_event() {
        let (state, id) = state_with_position();
        let payload = PushPayload {
            category: "balance".into(),
            mint: "MINT".into(),
            amount: Some(60.0),
            price: None,
            timestamp_ms: Some(778),
        };
        let event = canonicalize_push(&state, &payload).unwrap();
        assert_eq!(
            event,
            TriggerEvent::Balance {
                position_id: id,
                amount: 60.0,
                ts: 778,
            }
        );
    }

    #[test]
    fn other_categories_are_ignored() {
        let (state, _) = state_with_position();
        for category in ["transaction", "nft", "unknown"] {
            let payload = PushPayload {
                category: category.into(),
                mint: "MINT".into(),
                amount: Some(1.0),
                price: Some(1.0),
                timestamp_ms: None,
            };
            assert!(canonicalize_push(&state, &payload).is_none());
        }
    }

    #[test]
    fn unmonitored_mint_is_ignored() {
        let (state, _) = state_with_position();
        let payload = PushPayload {
            category: "swap".into(),
            mint: "SOMETHING_ELSE".into(),
            amount: None,
            price: Some(2.0),
            timestamp_ms: None,
        };
        assert!(canonicalize_push(&state, &payload).is_none());
    }

    #[test]
    fn missing_timestamp_is_stamped_with_arrival_time() {
        let (state, _) = state_with_position();
        let before = now_ms();
        let payload = PushPayload {
            category: "swap".into(),
            mint: "MINT".into(),
            amount: None,
            price: Some(1.1),
            timestamp_ms: None,
        };
        let event = canonicalize_push(&state, &payload).unwrap();
        assert!(event.ts() >= before);
    }

    #[tokio::test]
    async fn router_delivers_in_fifo_order() {
        let router = EventRouter::new();
        let id = Uuid::new_v4();
        let mut rx = router.register(id);

        for ts in 1..=3 {
            assert!(
                router
                    .publish(TriggerEvent::Price {
                        position_id: id,
                        price: ts as f64,
                        ts,
                    })
                    .await
            );
        }

        for expected_ts in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().ts(), expected_ts);
        }
    }

    #[tokio::test]
    async fn publish_to_removed_channel_reports_undelivered() {
        let router = EventRouter::new();
        let id = Uuid::new_v4();
        let _rx = router.register(id);
        router.remove(id);

        let delivered = router
            .publish(TriggerEvent::Price {
                position_id: id,
                price: 1.0,
                ts: 1,
            })
            .await;
        assert!(!delivered);
    }
}
