// =============================================================================
// Shared types used across the Vanta exit engine
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger identity
// ---------------------------------------------------------------------------

/// Identity of an exit trigger for fire-once bookkeeping. Each key may fire
/// at most once per position; partial take-profits are keyed by ladder level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKey {
    EmergencyStop,
    StopLoss,
    TrailingStop,
    PartialTakeProfit(usize),
    TakeProfit,
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmergencyStop => write!(f, "EMERGENCY"),
            Self::StopLoss => write!(f, "SL"),
            Self::TrailingStop => write!(f, "TRAIL"),
            Self::PartialTakeProfit(level) => write!(f, "PTP{}", level + 1),
            Self::TakeProfit => write!(f, "TP"),
        }
    }
}

// ---------------------------------------------------------------------------
// Exit reason
// ---------------------------------------------------------------------------

/// Why a position (or part of it) was sold. Carries the matched ladder level
/// for partial take-profits so the audit trail records which rung fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitReason {
    EmergencyStop,
    StopLoss,
    TrailingStop,
    PartialTakeProfit { level: usize, gain_pct: f64 },
    TakeProfit,
}

impl ExitReason {
    /// The fire-once key corresponding to this reason.
    pub fn key(&self) -> TriggerKey {
        match self {
            Self::EmergencyStop => TriggerKey::EmergencyStop,
            Self::StopLoss => TriggerKey::StopLoss,
            Self::TrailingStop => TriggerKey::TrailingStop,
            Self::PartialTakeProfit { level, .. } => TriggerKey::PartialTakeProfit(*level),
            Self::TakeProfit => TriggerKey::TakeProfit,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartialTakeProfit { level, gain_pct } => {
                write!(f, "PTP{} (+{:.0}%)", level + 1, gain_pct * 100.0)
            }
            other => write!(f, "{}", other.key()),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical trigger events
// ---------------------------------------------------------------------------

/// A canonical, timestamped update for one position. Produced by the ingest
/// gateway from both the push (webhook) and poll (oracle) paths, and consumed
/// by the position's worker in FIFO order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerEvent {
    /// A fresh price observation for the position's mint.
    Price {
        position_id: Uuid,
        price: f64,
        /// Epoch milliseconds.
        ts: i64,
    },
    /// A fresh token-balance observation for the position's mint.
    Balance {
        position_id: Uuid,
        amount: f64,
        /// Epoch milliseconds.
        ts: i64,
    },
}

impl TriggerEvent {
    pub fn position_id(&self) -> Uuid {
        match self {
            Self::Price { position_id, .. } | Self::Balance { position_id, .. } => *position_id,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            Self::Price { ts, .. } | Self::Balance { ts, .. } => *ts,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_maps_to_key() {
        assert_eq!(ExitReason::StopLoss.key(), TriggerKey::StopLoss);
        assert_eq!(
            ExitReason::PartialTakeProfit {
                level: 2,
                gain_pct: 0.5
            }
            .key(),
            TriggerKey::PartialTakeProfit(2)
        );
    }

    #[test]
    fn key_display_is_compact() {
        assert_eq!(TriggerKey::PartialTakeProfit(0).to_string(), "PTP1");
        assert_eq!(TriggerKey::TrailingStop.to_string(), "TRAIL");
    }

    #[test]
    fn event_accessors() {
        let id = Uuid::new_v4();
        let ev = TriggerEvent::Price {
            position_id: id,
            price: 1.25,
            ts: 42,
        };
        assert_eq!(ev.position_id(), id);
        assert_eq!(ev.ts(), 42);
    }
}
