// =============================================================================
// Trigger Evaluator — pure decision function for exits
// =============================================================================
//
// Maps a position's current state to at most one exit decision, checked in a
// fixed, total priority order:
//
//   1. Emergency stop  (drawdown beyond the emergency threshold) — full close
//   2. Stop-loss       (price at or below the stop price)        — full close
//   3. Trailing stop   (armed, price fell `distance` off the high)— full close
//   4. Partial TP      (first unexecuted ladder rung crossed)     — partial
//   5. Take-profit     (price at or above the full TP price)      — full close
//
// Exactly one partial decision per call: when one update crosses several
// rungs at once, the caller re-invokes the evaluator after each applied
// partial exit so the next rung sees the reduced position.
//
// The evaluator never returns a decision whose (kind, level) is already in
// the position's fired set. It is pure: high-watermark and trailing-arming
// bookkeeping happens in the registry on update-apply and is only read here.
// =============================================================================

use serde::Serialize;

use crate::registry::{Position, AMOUNT_EPS};
use crate::types::{ExitReason, TriggerKey};

/// An exit decision with a fixed priority order. Full-exit variants sell the
/// entire remaining amount; the partial variant sells a ladder-defined
/// fraction of the current remainder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExitDecision {
    None,
    EmergencyStop,
    StopLoss,
    TrailingStop,
    PartialTakeProfit {
        level: usize,
        gain_pct: f64,
        sell_fraction: f64,
    },
    TakeProfit,
}

impl ExitDecision {
    /// Fraction of the remaining amount this decision sells.
    pub fn sell_fraction(&self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::PartialTakeProfit { sell_fraction, .. } => *sell_fraction,
            _ => 1.0,
        }
    }

    /// Whether executing this decision liquidates the whole remainder.
    pub fn closes_position(&self) -> bool {
        match self {
            Self::None => false,
            Self::PartialTakeProfit { sell_fraction, .. } => {
                *sell_fraction >= 1.0 - AMOUNT_EPS
            }
            _ => true,
        }
    }

    /// The audit reason for this decision, `None` for no-op.
    pub fn reason(&self) -> Option<ExitReason> {
        match self {
            Self::None => None,
            Self::EmergencyStop => Some(ExitReason::EmergencyStop),
            Self::StopLoss => Some(ExitReason::StopLoss),
            Self::TrailingStop => Some(ExitReason::TrailingStop),
            Self::PartialTakeProfit {
                level, gain_pct, ..
            } => Some(ExitReason::PartialTakeProfit {
                level: *level,
                gain_pct: *gain_pct,
            }),
            Self::TakeProfit => Some(ExitReason::TakeProfit),
        }
    }
}

/// Evaluate a position against its thresholds. Invoked after every
/// successfully applied update, and re-invoked after each applied partial
/// exit.
pub fn evaluate(pos: &Position) -> ExitDecision {
    if !pos.active || pos.remaining_amount <= AMOUNT_EPS {
        return ExitDecision::None;
    }

    let pnl_pct = pos.pnl_pct();
    let t = &pos.thresholds;
    let fired = &pos.fired;

    // 1. Emergency stop — catastrophic drawdown, highest priority.
    if pnl_pct <= t.emergency_stop_pct && !fired.contains(&TriggerKey::EmergencyStop) {
        return ExitDecision::EmergencyStop;
    }

    // 2. Stop-loss.
    if pos.current_price <= t.stop_loss_price && !fired.contains(&TriggerKey::StopLoss) {
        return ExitDecision::StopLoss;
    }

    // 3. Trailing stop — armed once the gain has reached the activation
    //    threshold (registry bookkeeping), fires on the pullback.
    if pos.trailing_armed
        && pos.current_price <= pos.highest_price * (1.0 - t.trailing_distance)
        && !fired.contains(&TriggerKey::TrailingStop)
    {
        return ExitDecision::TrailingStop;
    }

    // 4. Partial take-profit ladder, ascending by gain: first unexecuted rung
    //    whose gain the position has reached. One rung per evaluation.
    for (level, rung) in t.ladder.iter().enumerate() {
        if fired.contains(&TriggerKey::PartialTakeProfit(level)) {
            continue;
        }
        if pnl_pct >= rung.gain_pct {
            return ExitDecision::PartialTakeProfit {
                level,
                gain_pct: rung.gain_pct,
                sell_fraction: rung.sell_fraction,
            };
        }
        // Rungs are ordered; nothing above this one can be crossed either.
        break;
    }

    // 5. Full take-profit.
    if pos.current_price >= t.take_profit_price && !fired.contains(&TriggerKey::TakeProfit) {
        return ExitDecision::TakeProfit;
    }

    ExitDecision::None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LadderRung;
    use crate::registry::{ExitThresholds, PositionRegistry};
    use crate::types::TriggerEvent;
    use uuid::Uuid;

    fn thresholds() -> ExitThresholds {
        ExitThresholds {
            stop_loss_price: 0.85,
            emergency_stop_pct: -0.40,
            take_profit_price: 2.00,
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
                LadderRung {
                    gain_pct: 0.50,
                    sell_fraction: 1.00,
                },
            ],
        }
    }

    /// Registry-backed fixture so high-watermark/arming bookkeeping matches
    /// the live pipeline.
    fn setup(thresholds: ExitThresholds) -> (PositionRegistry, Uuid) {
        let reg = PositionRegistry::new();
        let id = reg.register("MINT", 1.0, 100.0, 100.0, thresholds).unwrap();
        (reg, id)
    }

    fn push_price(reg: &PositionRegistry, id: Uuid, price: f64, ts: i64) {
        assert!(reg.apply_update(&TriggerEvent::Price {
            position_id: id,
            price,
            ts,
        }));
    }

    #[test]
    fn stop_loss_fires_on_drop() {
        // Entry $1.00, stop at -15%; drop to $0.84 is a full stop-loss exit.
        let (reg, id) = setup(thresholds());
        push_price(&reg, id, 0.84, 1);
        let decision = evaluate(&reg.snapshot(id).unwrap());
        assert_eq!(decision, ExitDecision::StopLoss);
        assert!((decision.sell_fraction() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn emergency_outranks_stop_loss() {
        let mut t = thresholds();
        t.emergency_stop_pct = -0.10;
        let (reg, id) = setup(t);
        // -16% breaches both the emergency threshold and the stop price.
        push_price(&reg, id, 0.84, 1);
        assert_eq!(evaluate(&reg.snapshot(id).unwrap()), ExitDecision::EmergencyStop);
    }

    #[test]
    fn priority_order_is_total() {
        // Thresholds arranged so a single price satisfies every trigger.
        let t = ExitThresholds {
            stop_loss_price: 2.00,
            emergency_stop_pct: 0.30, // pnl 20% sits below this synthetic floor
            take_profit_price: 1.10,
            trailing_activation_pct: 0.05,
            trailing_distance: 0.01,
            ladder: vec![LadderRung {
                gain_pct: 0.01,
                sell_fraction: 0.5,
            }],
        };
        let (reg, id) = setup(t);
        push_price(&reg, id, 1.50, 1);
        push_price(&reg, id, 1.20, 2);

        let mut pos = reg.snapshot(id).unwrap();
        assert_eq!(evaluate(&pos), ExitDecision::EmergencyStop);

        pos.fired.insert(TriggerKey::EmergencyStop);
        assert_eq!(evaluate(&pos), ExitDecision::StopLoss);

        pos.fired.insert(TriggerKey::StopLoss);
        assert_eq!(evaluate(&pos), ExitDecision::TrailingStop);

        pos.fired.insert(TriggerKey::TrailingStop);
        assert!(matches!(
            evaluate(&pos),
            ExitDecision::PartialTakeProfit { level: 0, .. }
        ));

        pos.fired.insert(TriggerKey::PartialTakeProfit(0));
        assert_eq!(evaluate(&pos), ExitDecision::TakeProfit);

        pos.fired.insert(TriggerKey::TakeProfit);
        assert_eq!(evaluate(&pos), ExitDecision::None);
    }

    #[test]
    fn ladder_steps_fire_sequentially() {
        // Entry $1.00, ladder [15%→0.3, 25%→0.5, 50%→1.0].
        let (reg, id) = setup(thresholds());

        // +16%: first rung sells 30% of remaining.
        push_price(&reg, id, 1.16, 1);
        let decision = evaluate(&reg.snapshot(id).unwrap());
        assert_eq!(
            decision,
            ExitDecision::PartialTakeProfit {
                level: 0,
                gain_pct: 0.15,
                sell_fraction: 0.30,
            }
        );

        let reason = decision.reason().unwrap();
        reg.apply_partial_exit(id, 0.30, 34.8, &reason).unwrap();

        // Re-evaluation at the same price: second rung not yet crossed.
        assert_eq!(evaluate(&reg.snapshot(id).unwrap()), ExitDecision::None);

        // +26%: second rung sells 50% of the now-reduced remainder.
        push_price(&reg, id, 1.26, 2);
        let decision = evaluate(&reg.snapshot(id).unwrap());
        assert_eq!(
            decision,
            ExitDecision::PartialTakeProfit {
                level: 1,
                gain_pct: 0.25,
                sell_fraction: 0.50,
            }
        );
        let reason = decision.reason().unwrap();
        let pos = reg.apply_partial_exit(id, 0.50, 44.1, &reason).unwrap();
        assert!((pos.remaining_amount - 35.0).abs() < 1e-9);
    }

    #[test]
    fn one_partial_per_evaluation_even_when_two_rungs_cross() {
        let (reg, id) = setup(thresholds());
        // +30% crosses both the 15% and 25% rungs in one update.
        push_price(&reg, id, 1.30, 1);

        let first = evaluate(&reg.snapshot(id).unwrap());
        assert!(matches!(
            first,
            ExitDecision::PartialTakeProfit { level: 0, .. }
        ));
        reg.apply_partial_exit(id, 0.30, 39.0, &first.reason().unwrap())
            .unwrap();

        // Only after the first rung is applied does the second fire.
        let second = evaluate(&reg.snapshot(id).unwrap());
        assert!(matches!(
            second,
            ExitDecision::PartialTakeProfit { level: 1, .. }
        ));
    }

    #[test]
    fn trailing_stop_scenario() {
        // Activation +50%, distance 30%.
        let (reg, id) = setup(ExitThresholds {
            stop_loss_price: 0.50,
            emergency_stop_pct: -0.60,
            take_profit_price: 10.0,
            trailing_activation_pct: 0.50,
            trailing_distance: 0.30,
            ladder: vec![LadderRung {
                gain_pct: 5.0,
                sell_fraction: 0.5,
            }],
        });

        // Rise to $1.80 (+80%): armed, high watermark 1.80.
        push_price(&reg, id, 1.80, 1);
        assert_eq!(evaluate(&reg.snapshot(id).unwrap()), ExitDecision::None);

        // Fall to $1.50 — only 16.7% below the high, no trigger.
        push_price(&reg, id, 1.50, 2);
        assert_eq!(evaluate(&reg.snapshot(id).unwrap()), ExitDecision::None);

        // Fall to $1.26 — exactly 30% below $1.80.
        push_price(&reg, id, 1.26, 3);
        assert_eq!(evaluate(&reg.snapshot(id).unwrap()), ExitDecision::TrailingStop);
    }

    #[test]
    fn trailing_does_not_fire_unarmed() {
        let (reg, id) = setup(thresholds());
        // +30% never reaches the +50% activation; a pullback past the
        // distance must not fire the trailing stop.
        push_price(&reg, id, 1.30, 1);
        push_price(&reg, id, 0.90, 2);
        let decision = evaluate(&reg.snapshot(id).unwrap());
        assert_ne!(decision, ExitDecision::TrailingStop);
    }

    #[test]
    fn full_take_profit() {
        let (reg, id) = setup(ExitThresholds {
            ladder: vec![LadderRung {
                gain_pct: 5.0,
                sell_fraction: 0.5,
            }],
            ..thresholds()
        });
        push_price(&reg, id, 2.10, 1);
        // +110% arms the trailing stop but the price sits at the high, so the
        // full take-profit wins.
        assert_eq!(evaluate(&reg.snapshot(id).unwrap()), ExitDecision::TakeProfit);
    }

    #[test]
    fn fired_triggers_never_return() {
        let (reg, id) = setup(thresholds());
        push_price(&reg, id, 1.16, 1);

        let mut pos = reg.snapshot(id).unwrap();
        pos.fired.insert(TriggerKey::PartialTakeProfit(0));
        // First rung already fired; the 25% rung is not crossed at +16%.
        assert_eq!(evaluate(&pos), ExitDecision::None);
    }

    #[test]
    fn inactive_or_empty_positions_yield_none() {
        let (reg, id) = setup(thresholds());
        push_price(&reg, id, 0.84, 1);
        let mut pos = reg.snapshot(id).unwrap();

        pos.active = false;
        assert_eq!(evaluate(&pos), ExitDecision::None);

        pos.active = true;
        pos.remaining_amount = 0.0;
        assert_eq!(evaluate(&pos), ExitDecision::None);
    }

    #[test]
    fn full_fraction_rung_closes_position() {
        let decision = ExitDecision::PartialTakeProfit {
            level: 2,
            gain_pct: 0.50,
            sell_fraction: 1.0,
        };
        assert!(decision.closes_position());

        let partial = ExitDecision::PartialTakeProfit {
            level: 0,
            gain_pct: 0.15,
            sell_fraction: 0.30,
        };
        assert!(!partial.closes_position());
    }
}
