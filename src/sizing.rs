// =============================================================================
// Risk Sizing — initial position size + exit-threshold set at open time
// =============================================================================
//
// Runs exactly once per position, before the (external) buy is confirmed.
// Pure computation: no locks, no I/O, no side effects.
//
//   risk_multiplier = clamp(1 - risk_score / 100, 0.3, 1.0)
//   position_size   = min(max_single_position_pct * balance * risk_multiplier,
//                         max_portfolio_exposure_pct * balance - exposure)
//
// A position is rejected (None) when the computed size falls below the
// minimum floor or when no exposure headroom remains. Exit thresholds scale
// with the same multiplier: riskier tokens get tighter stops and nearer
// take-profits.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::config::{LadderRung, SizingParams};
use crate::registry::ExitThresholds;

/// Lower clamp of the risk multiplier — even the riskiest token keeps 30 %
/// of the base allocation.
const MIN_RISK_MULTIPLIER: f64 = 0.3;

/// Sizing output: how much to buy and which exit thresholds to arm.
#[derive(Debug, Clone, Serialize)]
pub struct SizedPosition {
    /// Position size in base-currency units.
    pub position_size: f64,

    /// Multiplier actually applied (clamped).
    pub risk_multiplier: f64,

    /// Stop-loss distance below entry, as a fraction.
    pub stop_loss_pct: f64,

    /// Emergency-stop drawdown, as a (positive) fraction.
    pub emergency_stop_pct: f64,

    /// Full take-profit gain above entry, as a fraction.
    pub take_profit_pct: f64,

    /// Unrealised gain at which the trailing stop arms.
    pub trailing_activation_pct: f64,

    /// Pullback from the peak that fires the trailing stop.
    pub trailing_distance: f64,

    /// Partial take-profit ladder.
    pub ladder: Vec<LadderRung>,
}

impl SizedPosition {
    /// Materialise the threshold set at a concrete entry price.
    pub fn thresholds_at(&self, entry_price: f64) -> ExitThresholds {
        ExitThresholds {
            stop_loss_price: entry_price * (1.0 - self.stop_loss_pct),
            emergency_stop_pct: -self.emergency_stop_pct,
            take_profit_price: entry_price * (1.0 + self.take_profit_pct),
            trailing_activation_pct: self.trailing_activation_pct,
            trailing_distance: self.trailing_distance,
            ladder: self.ladder.clone(),
        }
    }
}

/// Compute the initial size and threshold set for a candidate position.
///
/// Returns `None` when the position should not be opened: either the
/// remaining exposure headroom is gone or the risk-scaled size falls below
/// the minimum floor.
pub fn size(
    risk_score: f64,
    wallet_balance: f64,
    current_exposure: f64,
    params: &SizingParams,
) -> Option<SizedPosition> {
    let risk_multiplier = (1.0 - risk_score / 100.0).clamp(MIN_RISK_MULTIPLIER, 1.0);

    let headroom = params.max_portfolio_exposure_pct * wallet_balance - current_exposure;
    if headroom <= 0.0 {
        debug!(
            risk_score,
            wallet_balance, current_exposure, "sizing rejected: no exposure headroom"
        );
        return None;
    }

    let base_size = params.max_single_position_pct * wallet_balance * risk_multiplier;
    let position_size = base_size.min(headroom);

    if position_size < params.min_position_size {
        debug!(
            risk_score,
            position_size,
            floor = params.min_position_size,
            "sizing rejected: below minimum floor"
        );
        return None;
    }

    // Riskier token -> tighter stop and nearer full take-profit. Trailing
    // activation/distance and the ladder stay fixed: the ladder already
    // expresses staged de-risking.
    let stop_loss_pct = params.stop_loss_pct * risk_multiplier;
    let take_profit_pct = params.take_profit_pct * risk_multiplier;

    debug!(
        risk_score,
        risk_multiplier,
        position_size,
        stop_loss_pct,
        take_profit_pct,
        "position sized"
    );

    Some(SizedPosition {
        position_size,
        risk_multiplier,
        stop_loss_pct,
        emergency_stop_pct: params.emergency_stop_pct,
        take_profit_pct,
        trailing_activation_pct: params.trailing_activation_pct,
        trailing_distance: params.trailing_distance,
        ladder: params.ladder.clone(),
    })
}

// =============================================================================
// Tests
// =============================================================================
