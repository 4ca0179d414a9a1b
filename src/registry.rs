// =============================================================================
// Position Registry — authoritative state of every monitored position
// =============================================================================
//
// Life-cycle:
//   registered (confirmed buy)  ->  partial exits (ladder)  ->  closed
//   registered                  ->  closed (emergency / SL / trailing / TP)
//
// Structure: an indexed map keyed by position id. Each entry sits behind its
// own `parking_lot::Mutex`, so mutation on a given position is serialized
// while updates to different positions proceed independently. There is no
// global write lock on the hot path; the outer map lock is held only to look
// an entry up.
//
// Timestamp gating: `last_event_ts` is monotonically non-decreasing. Events
// carrying an older or equal timestamp are discarded, not applied, which makes
// redelivered webhook payloads harmless.
//
// Closed positions are retained for audit, never deleted.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LadderRung;
use crate::error::EngineError;
use crate::types::{ExitReason, TriggerEvent, TriggerKey};

/// Tolerance for float accounting on amounts and fractions.
pub const AMOUNT_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Exit thresholds armed at open time, fixed for the position's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitThresholds {
    /// Absolute price below which remaining holdings are fully liquidated.
    pub stop_loss_price: f64,

    /// Drawdown (negative fraction, e.g. -0.40) at which the emergency stop
    /// fires. Takes priority over every other trigger.
    pub emergency_stop_pct: f64,

    /// Absolute price at or above which the full take-profit fires.
    pub take_profit_price: f64,

    /// Unrealised gain at which the trailing stop arms.
    pub trailing_activation_pct: f64,

    /// Pullback from the highest observed price that fires the trailing stop.
    pub trailing_distance: f64,

    /// Partial take-profit ladder, ascending by gain.
    pub ladder: Vec<LadderRung>,
}

/// A single monitored position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: Uuid,

    /// Token mint this position holds.
    pub mint: String,

    pub entry_price: f64,

    /// Amount of tokens bought at entry.
    pub entry_amount: f64,

    /// Tokens still held (reduced by partial exits and balance updates).
    pub remaining_amount: f64,

    /// Base-currency capital spent at entry.
    pub invested: f64,

    #[serde(default)]
    pub current_price: f64,

    /// Highest price observed since entry; drives the trailing stop.
    #[serde(default)]
    pub highest_price: f64,

    /// Whether the trailing stop has armed (gain once reached activation).
    #[serde(default)]
    pub trailing_armed: bool,

    pub active: bool,

    pub opened_at: String,

    /// Timestamp (epoch ms) of the last applied event. Monotone.
    #[serde(default)]
    pub last_event_ts: i64,

    pub thresholds: ExitThresholds,

    /// Triggers that have already executed. Persisted, so a restart cannot
    /// re-fire an already-executed trigger.
    #[serde(default)]
    pub fired: HashSet<TriggerKey>,

    #[serde(default)]
    pub exit_reason: Option<ExitReason>,

    #[serde(default)]
    pub closed_at: Option<String>,

    /// Base-currency proceeds realised across all exits.
    #[serde(default)]
    pub realized_proceeds: f64,

    /// Realised PnL accumulated across all exits.
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    /// Unrealised gain/loss of the current price relative to entry, as a
    /// fraction (-0.16 = down 16 %).
    pub fn pnl_pct(&self) -> f64 {
        if self.entry_price > 0.0 {
            (self.current_price - self.entry_price) / self.entry_price
        } else {
            0.0
        }
    }

    /// Fraction of the entry amount still held.
    pub fn remaining_fraction(&self) -> f64 {
        if self.entry_amount > 0.0 {
            self.remaining_amount / self.entry_amount
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Entry = Arc<Mutex<Position>>;

/// Thread-safe owner of all positions, open and closed.
pub struct PositionRegistry {
    positions: RwLock<HashMap<Uuid, Entry>>,
}

impl PositionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a confirmed buy as a new monitored position.
    ///
    /// Fails with `DuplicateActivePosition` if an active position already
    /// exists for `mint` — at most one active position per asset.
    pub fn register(
        &self,
        mint: &str,
        entry_price: f64,
        amount: f64,
        invested: f64,
        thresholds: ExitThresholds,
    ) -> Result<Uuid, EngineError> {
        if self.find_active_by_mint(mint).is_some() {
            return Err(EngineError::DuplicateActivePosition(mint.to_string()));
        }

        let id = Uuid::new_v4();
        let position = Position {
            id,
            mint: mint.to_string(),
            entry_price,
            entry_amount: amount,
            remaining_amount: amount,
            invested,
            current_price: entry_price,
            highest_price: entry_price,
            trailing_armed: false,
            active: true,
            opened_at: Utc::now().to_rfc3339(),
            last_event_ts: 0,
            thresholds,
            fired: HashSet::new(),
            exit_reason: None,
            closed_at: None,
            realized_proceeds: 0.0,
            realized_pnl: 0.0,
        };

        info!(
            id = %id,
            mint,
            entry_price,
            amount,
            invested,
            stop_loss = position.thresholds.stop_loss_price,
            take_profit = position.thresholds.take_profit_price,
            "position registered"
        );

        self.positions
            .write()
            .insert(id, Arc::new(Mutex::new(position)));
        Ok(id)
    }

    /// Re-insert a position restored from a durable snapshot. Keeps its id,
    /// fired-trigger set, and audit fields exactly as persisted.
    pub fn insert_restored(&self, position: Position) -> Result<(), EngineError> {
        if position.active && self.find_active_by_mint(&position.mint).is_some() {
            return Err(EngineError::DuplicateActivePosition(position.mint));
        }
        info!(
            id = %position.id,
            mint = %position.mint,
            active = position.active,
            fired = position.fired.len(),
            "position restored from snapshot"
        );
        self.positions
            .write()
            .insert(position.id, Arc::new(Mutex::new(position)));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Apply a canonical trigger event.
    ///
    /// Returns `false` (no mutation) when the event is stale (`ts` at or
    /// before the last applied timestamp), the position is inactive, or the
    /// position is unknown. Price updates refresh `current_price`,
    /// `highest_price`, and trailing-stop arming before the evaluator runs.
    pub fn apply_update(&self, event: &TriggerEvent) -> bool {
        let Some(entry) = self.entry(event.position_id()) else {
            warn!(id = %event.position_id(), "update for unknown position discarded");
            return false;
        };

        let mut pos = entry.lock();

        if !pos.active {
            debug!(id = %pos.id, "update for inactive position discarded");
            return false;
        }
        if event.ts() <= pos.last_event_ts {
            debug!(
                id = %pos.id,
                event_ts = event.ts(),
                last_ts = pos.last_event_ts,
                "stale event discarded"
            );
            return false;
        }

        match *event {
            TriggerEvent::Price { price, .. } => {
                if price <= 0.0 {
                    warn!(id = %pos.id, price, "non-positive price discarded");
                    return false;
                }
                pos.current_price = price;
                if price > pos.highest_price {
                    pos.highest_price = price;
                    debug!(
                        id = %pos.id,
                        highest_price = pos.highest_price,
                        "new high watermark"
                    );
                }
                if !pos.trailing_armed && pos.pnl_pct() >= pos.thresholds.trailing_activation_pct {
                    pos.trailing_armed = true;
                    info!(
                        id = %pos.id,
                        pnl_pct = pos.pnl_pct(),
                        activation = pos.thresholds.trailing_activation_pct,
                        "trailing stop armed"
                    );
                }
            }
            TriggerEvent::Balance { amount, .. } => {
                if amount < 0.0 {
                    warn!(id = %pos.id, amount, "negative balance observation discarded");
                    return false;
                }
                // The managed remainder only ever shrinks. An observation
                // above it is an airdrop, an external top-up, or a reading
                // taken before a partial exit settled; applying it would
                // let the engine resell tokens it already sold.
                if amount > pos.remaining_amount + AMOUNT_EPS {
                    warn!(
                        id = %pos.id,
                        amount,
                        remaining = pos.remaining_amount,
                        "balance observation above managed remainder discarded"
                    );
                    return false;
                }
                pos.remaining_amount = amount;
            }
        }

        pos.last_event_ts = event.ts();
        true
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    /// Apply a confirmed partial exit: reduce the remaining amount by
    /// `sold_fraction` of itself, accumulate realised PnL, and record the
    /// fired trigger key.
    ///
    /// Fails with `DataInconsistency` — and performs no mutation — if the
    /// resulting remaining amount would go negative. The error is surfaced,
    /// never silently clamped.
    pub fn apply_partial_exit(
        &self,
        id: Uuid,
        sold_fraction: f64,
        proceeds: f64,
        reason: &ExitReason,
    ) -> Result<Position, EngineError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string()))?;
        let mut pos = entry.lock();

        if !pos.active {
            return Err(EngineError::PositionNotFound(format!("{id} (inactive)")));
        }

        let sell_amount = pos.remaining_amount * sold_fraction;
        let new_remaining = pos.remaining_amount - sell_amount;
        if new_remaining < -AMOUNT_EPS {
            return Err(EngineError::DataInconsistency {
                position_id: id.to_string(),
                detail: format!(
                    "partial exit of fraction {sold_fraction} would leave {new_remaining} tokens"
                ),
            });
        }

        // Cost basis of the sold chunk, proportional to entry amount.
        let cost_basis = if pos.entry_amount > 0.0 {
            pos.invested * (sell_amount / pos.entry_amount)
        } else {
            0.0
        };
        let partial_pnl = proceeds - cost_basis;

        pos.remaining_amount = new_remaining.max(0.0);
        pos.realized_proceeds += proceeds;
        pos.realized_pnl += partial_pnl;
        pos.fired.insert(reason.key());

        info!(
            id = %id,
            reason = %reason,
            sold_fraction,
            sell_amount,
            remaining = pos.remaining_amount,
            proceeds,
            partial_pnl,
            "partial exit applied"
        );

        Ok(pos.clone())
    }

    /// Apply a confirmed full exit: deactivate the position and record audit
    /// fields. No further amount or threshold mutation is possible afterwards.
    pub fn apply_full_exit(
        &self,
        id: Uuid,
        proceeds: f64,
        reason: &ExitReason,
    ) -> Result<Position, EngineError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string()))?;
        let mut pos = entry.lock();

        if !pos.active {
            return Err(EngineError::PositionNotFound(format!("{id} (inactive)")));
        }

        let cost_basis = if pos.entry_amount > 0.0 {
            pos.invested * (pos.remaining_amount / pos.entry_amount)
        } else {
            0.0
        };
        let final_pnl = proceeds - cost_basis;

        pos.remaining_amount = 0.0;
        pos.realized_proceeds += proceeds;
        pos.realized_pnl += final_pnl;
        pos.fired.insert(reason.key());
        pos.active = false;
        pos.exit_reason = Some(reason.clone());
        pos.closed_at = Some(Utc::now().to_rfc3339());

        info!(
            id = %id,
            reason = %reason,
            proceeds,
            realized_pnl = pos.realized_pnl,
            "position closed"
        );

        Ok(pos.clone())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether a position exists and is still active.
    pub fn is_active(&self, id: Uuid) -> bool {
        self.entry(id).map(|e| e.lock().active).unwrap_or(false)
    }

    /// Clone a single position's state.
    pub fn snapshot(&self, id: Uuid) -> Option<Position> {
        self.entry(id).map(|e| e.lock().clone())
    }

    /// The id of the active position holding `mint`, if any.
    pub fn find_active_by_mint(&self, mint: &str) -> Option<Uuid> {
        let map = self.positions.read();
        map.values().find_map(|entry| {
            let pos = entry.lock();
            (pos.active && pos.mint == mint).then_some(pos.id)
        })
    }

    /// Snapshot of all active positions.
    pub fn active_positions(&self) -> Vec<Position> {
        self.collect(|p| p.active)
    }

    /// Snapshot of all closed positions.
    pub fn closed_positions(&self) -> Vec<Position> {
        self.collect(|p| !p.active)
    }

    /// Snapshot of every position, active and closed, for persistence.
    pub fn all_positions(&self) -> Vec<Position> {
        self.collect(|_| true)
    }

    /// Base-currency capital currently at risk across active positions,
    /// weighted by the fraction still held.
    pub fn current_exposure(&self) -> f64 {
        self.active_positions()
            .iter()
            .map(|p| p.invested * p.remaining_fraction())
            .sum()
    }

    fn entry(&self, id: Uuid) -> Option<Entry> {
        self.positions.read().get(&id).cloned()
    }

    fn collect(&self, keep: impl Fn(&Position) -> bool) -> Vec<Position> {
        let entries: Vec<Entry> = self.positions.read().values().cloned().collect();
        entries
            .iter()
            .filter_map(|e| {
                let pos = e.lock();
                keep(&pos).then(|| pos.clone())
            })
            .collect()
    }
}

impl Default for PositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.positions.read();
        f.debug_struct("PositionRegistry")
            .field("positions", &map.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ExitThresholds {
        ExitThresholds {
            stop_loss_price: 0.85,
            emergency_stop_pct: -0.40,
            take_profit_price: 2.0,
            trailing_activation_pct: 0.50,
            trailing_distance: 0.30,
            ladder: vec![
                LadderRung {
                    gain_pct: 0.15,
                    sell_fraction: 0.30,
                },
                LadderRung {
                    gain_pct: 0.25,
                    sell_fraction: 0.50,
                },
            ],
        }
    }

    fn price_event(id: Uuid, price: f64, ts: i64) -> TriggerEvent {
        TriggerEvent::Price {
            position_id: id,
            price,
            ts,
        }
    }

    #[test]
    fn register_rejects_duplicate_active_mint() {
        let reg = PositionRegistry::new();
        reg.register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        let err = reg
            .register("MINT", 1.1, 50.0, 55.0, thresholds())
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateActivePosition(_)));

        // A different mint is fine.
        reg.register("OTHER", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
    }

    #[test]
    fn duplicate_allowed_after_close() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        reg.apply_full_exit(id, 90.0, &ExitReason::StopLoss).unwrap();
        reg.register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
    }

    #[test]
    fn stale_events_are_discarded() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();

        assert!(reg.apply_update(&price_event(id, 1.10, 100)));
        // Equal timestamp: discarded.
        assert!(!reg.apply_update(&price_event(id, 1.20, 100)));
        // Older timestamp: discarded.
        assert!(!reg.apply_update(&price_event(id, 1.30, 50)));

        let pos = reg.snapshot(id).unwrap();
        assert!((pos.current_price - 1.10).abs() < 1e-12);
        assert_eq!(pos.last_event_ts, 100);
    }

    #[test]
    fn updates_to_inactive_positions_are_discarded() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        reg.apply_full_exit(id, 85.0, &ExitReason::StopLoss).unwrap();

        assert!(!reg.apply_update(&price_event(id, 0.50, 999)));
        let pos = reg.snapshot(id).unwrap();
        assert!(!pos.active);
        assert_eq!(pos.remaining_amount, 0.0);
    }

    #[test]
    fn highest_price_and_trailing_arming() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();

        reg.apply_update(&price_event(id, 1.40, 1));
        let pos = reg.snapshot(id).unwrap();
        assert!((pos.highest_price - 1.40).abs() < 1e-12);
        assert!(!pos.trailing_armed);

        reg.apply_update(&price_event(id, 1.80, 2));
        let pos = reg.snapshot(id).unwrap();
        assert!(pos.trailing_armed);

        // Falling price does not lower the high watermark or disarm.
        reg.apply_update(&price_event(id, 1.20, 3));
        let pos = reg.snapshot(id).unwrap();
        assert!((pos.highest_price - 1.80).abs() < 1e-12);
        assert!(pos.trailing_armed);
    }

    #[test]
    fn partial_exit_accounting() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        reg.apply_update(&price_event(id, 1.16, 1));

        let reason = ExitReason::PartialTakeProfit {
            level: 0,
            gain_pct: 0.15,
        };
        // Sell 30% of remaining at 1.16: 30 tokens for 34.8.
        let pos = reg.apply_partial_exit(id, 0.30, 34.8, &reason).unwrap();
        assert!((pos.remaining_amount - 70.0).abs() < 1e-9);
        // Cost basis of 30 tokens = 30.0; pnl = 4.8.
        assert!((pos.realized_pnl - 4.8).abs() < 1e-9);
        assert!(pos.fired.contains(&TriggerKey::PartialTakeProfit(0)));
        assert!(pos.active);

        // Sold fraction + remaining fraction accounts to 1.
        assert!((pos.remaining_fraction() - 0.70).abs() < 1e-9);
    }

    #[test]
    fn partial_exit_rejects_negative_remaining() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();

        let reason = ExitReason::PartialTakeProfit {
            level: 0,
            gain_pct: 0.15,
        };
        let err = reg.apply_partial_exit(id, 1.5, 150.0, &reason).unwrap_err();
        assert!(matches!(err, EngineError::DataInconsistency { .. }));

        // No mutation happened.
        let pos = reg.snapshot(id).unwrap();
        assert!((pos.remaining_amount - 100.0).abs() < 1e-12);
        assert!(pos.fired.is_empty());
        assert_eq!(pos.realized_pnl, 0.0);
    }

    #[test]
    fn full_exit_records_audit_fields() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        reg.apply_update(&price_event(id, 0.84, 1));

        let pos = reg.apply_full_exit(id, 84.0, &ExitReason::StopLoss).unwrap();
        assert!(!pos.active);
        assert_eq!(pos.exit_reason, Some(ExitReason::StopLoss));
        assert!(pos.closed_at.is_some());
        assert!((pos.realized_pnl - (-16.0)).abs() < 1e-9);
        assert!(pos.fired.contains(&TriggerKey::StopLoss));

        // A second full exit is refused.
        assert!(reg.apply_full_exit(id, 84.0, &ExitReason::StopLoss).is_err());
    }

    #[test]
    fn balance_update_only_ever_shrinks_the_remainder() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();

        assert!(reg.apply_update(&TriggerEvent::Balance {
            position_id: id,
            amount: 60.0,
            ts: 1,
        }));
        assert!((reg.snapshot(id).unwrap().remaining_amount - 60.0).abs() < 1e-12);

        // An observation above the remainder (airdrop, external top-up) is
        // discarded outright, not applied or clamped.
        assert!(!reg.apply_update(&TriggerEvent::Balance {
            position_id: id,
            amount: 500.0,
            ts: 2,
        }));
        let pos = reg.snapshot(id).unwrap();
        assert!((pos.remaining_amount - 60.0).abs() < 1e-12);
        assert_eq!(pos.last_event_ts, 1);
    }

    #[test]
    fn delayed_balance_cannot_reinflate_after_partial_exit() {
        let reg = PositionRegistry::new();
        let id = reg
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        let reason = ExitReason::PartialTakeProfit {
            level: 0,
            gain_pct: 0.15,
        };
        reg.apply_partial_exit(id, 0.30, 34.8, &reason).unwrap();

        // A pre-exit wallet reading arriving late with a fresh timestamp
        // must not resurrect the 30 tokens already sold.
        assert!(!reg.apply_update(&TriggerEvent::Balance {
            position_id: id,
            amount: 100.0,
            ts: 50,
        }));
        assert!((reg.snapshot(id).unwrap().remaining_amount - 70.0).abs() < 1e-9);

        // A reading at or below the remainder still applies.
        assert!(reg.apply_update(&TriggerEvent::Balance {
            position_id: id,
            amount: 65.0,
            ts: 51,
        }));
        assert!((reg.snapshot(id).unwrap().remaining_amount - 65.0).abs() < 1e-9);
    }

    #[test]
    fn exposure_is_remaining_weighted() {
        let reg = PositionRegistry::new();
        let a = reg
            .register("A", 1.0, 100.0, 200.0, thresholds())
            .unwrap();
        reg.register("B", 1.0, 100.0, 100.0, thresholds()).unwrap();

        assert!((reg.current_exposure() - 300.0).abs() < 1e-9);

        let reason = ExitReason::PartialTakeProfit {
            level: 0,
            gain_pct: 0.15,
        };
        reg.apply_partial_exit(a, 0.50, 120.0, &reason).unwrap();
        assert!((reg.current_exposure() - 200.0).abs() < 1e-9);
    }
}
