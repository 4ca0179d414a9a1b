// =============================================================================
// Notification Sink — best-effort structured event delivery
// =============================================================================
//
// Every externally interesting engine outcome goes through here:
// registrations, executed sells, failed sells, and closures. Events are
// always logged; when a sink URL is configured they are also POSTed to it.
//
// Delivery is strictly best-effort: a sink failure is logged at warn and
// swallowed. Engine correctness never depends on this path.
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::registry::Position;

/// A structured event for the external notification channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkEvent {
    PositionRegistered {
        position: Position,
    },
    PositionClosed {
        position: Position,
        reason: String,
        pnl_percent: f64,
    },
    SellExecuted {
        position: Position,
        reason: String,
        pnl_percent: f64,
        sell_fraction: f64,
    },
    SellFailed {
        position: Position,
        reason: String,
        sell_fraction: f64,
    },
}

impl SinkEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::PositionRegistered { .. } => "position_registered",
            Self::PositionClosed { .. } => "position_closed",
            Self::SellExecuted { .. } => "sell_executed",
            Self::SellFailed { .. } => "sell_failed",
        }
    }
}

/// Best-effort sink: logs always, POSTs when an endpoint is configured.
pub struct NotificationSink {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl NotificationSink {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self { endpoint, client }
    }

    /// Emit an event. Never returns an error: sink failures are logged and
    /// dropped.
    pub async fn emit(&self, event: SinkEvent) {
        match &event {
            SinkEvent::PositionRegistered { position } => {
                info!(
                    event = event.kind(),
                    id = %position.id,
                    mint = %position.mint,
                    entry_price = position.entry_price,
                    amount = position.entry_amount,
                    "notification"
                );
            }
            SinkEvent::PositionClosed {
                position,
                reason,
                pnl_percent,
            } => {
                info!(
                    event = event.kind(),
                    id = %position.id,
                    reason = %reason,
                    pnl_percent,
                    realized_pnl = position.realized_pnl,
                    "notification"
                );
            }
            SinkEvent::SellExecuted {
                position,
                reason,
                pnl_percent,
                sell_fraction,
            } => {
                info!(
                    event = event.kind(),
                    id = %position.id,
                    reason = %reason,
                    pnl_percent,
                    sell_fraction,
                    remaining = position.remaining_amount,
                    "notification"
                );
            }
            SinkEvent::SellFailed {
                position,
                reason,
                sell_fraction,
            } => {
                warn!(
                    event = event.kind(),
                    id = %position.id,
                    reason = %reason,
                    sell_fraction,
                    "notification"
                );
            }
        }

        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let result = self.client.post(endpoint).json(&event).send().await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    endpoint = %endpoint,
                    status = %resp.status(),
                    event = event.kind(),
                    "sink rejected event — dropped"
                );
            }
            Err(e) => {
                warn!(
                    endpoint = %endpoint,
                    error = %e,
                    event = event.kind(),
                    "sink delivery failed — dropped"
                );
            }
            Ok(_) => {}
        }
    }
}

impl std::fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSink")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
