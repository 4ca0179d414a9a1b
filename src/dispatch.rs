// =============================================================================
// Execution Dispatcher — turns exit decisions into confirmed swaps
// =============================================================================
//
// Contract: quote then swap, bounded retries with exponential backoff, and —
// the load-bearing invariant — a trigger is marked fired ONLY on confirmed
// execution. Exhausted retries leave the position untouched, so the same
// trigger fires again on the next event.
//
// The dispatcher never panics a worker: every failure path resolves to a
// `DispatchOutcome` and a sink event.
// =============================================================================

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::evaluator::ExitDecision;
use crate::registry::AMOUNT_EPS;
use crate::state::EngineState;
use crate::swap::{SwapReceipt, SwapService};
use crate::types::ExitReason;

/// Result of dispatching one exit decision.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The sell confirmed and the registry was updated.
    Executed { closed: bool },
    /// Every attempt failed; the position is unchanged and the trigger
    /// remains unfired.
    Failed(EngineError),
    /// Nothing to do (no-op decision, already-fired trigger, dust remainder,
    /// or the position went away).
    Skipped,
}

/// Executes exit decisions against the swap service. Generic over the service
/// so tests can substitute a scripted one.
pub struct Dispatcher<S: SwapService> {
    state: Arc<EngineState>,
    swap: Arc<S>,
}

impl<S: SwapService> Dispatcher<S> {
    pub fn new(state: Arc<EngineState>, swap: Arc<S>) -> Self {
        Self { state, swap }
    }

    /// Dispatch one decision for one position.
    ///
    /// Holds no registry lock across the network calls; the registry is
    /// touched once up front for the snapshot and once after confirmation.
    pub async fn execute(&self, position_id: Uuid, decision: &ExitDecision) -> DispatchOutcome {
        let Some(reason) = decision.reason() else {
            return DispatchOutcome::Skipped;
        };

        let Some(pos) = self.state.registry.snapshot(position_id) else {
            warn!(id = %position_id, "dispatch for unknown position skipped");
            return DispatchOutcome::Skipped;
        };
        if !pos.active {
            return DispatchOutcome::Skipped;
        }

        // Fire-once guard: a (kind, level) that already executed is never
        // re-dispatched, even across restarts.
        if pos.fired.contains(&reason.key()) {
            self.state
                .counters
                .duplicate_triggers_ignored
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(id = %position_id, reason = %reason, "trigger already fired — skipped");
            return DispatchOutcome::Skipped;
        }

        let sell_fraction = decision.sell_fraction();
        let sell_amount = pos.remaining_amount * sell_fraction;
        if sell_amount <= AMOUNT_EPS {
            debug!(id = %position_id, reason = %reason, "dust remainder — nothing to sell");
            return DispatchOutcome::Skipped;
        }

        let (base_mint, slippage_bps, priority_fee, max_attempts, backoff_base_ms) = {
            let cfg = self.state.config.read();
            (
                cfg.base_mint.clone(),
                cfg.slippage_bps,
                cfg.priority_fee_lamports,
                cfg.max_sell_attempts,
                cfg.backoff_base_ms,
            )
        };

        info!(
            id = %position_id,
            mint = %pos.mint,
            reason = %reason,
            sell_fraction,
            sell_amount,
            "dispatching exit"
        );

        let receipt = match self
            .sell_with_retries(
                &pos.mint,
                &base_mint,
                sell_amount,
                slippage_bps,
                priority_fee,
                max_attempts,
                backoff_base_ms,
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(
                    id = %position_id,
                    reason = %reason,
                    error = %e,
                    error_kind = e.label(),
                    "exit failed after retries — position unchanged"
                );
                self.state
                    .counters
                    .sells_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.state
                    .sink
                    .emit(crate::notify::SinkEvent::SellFailed {
                        position: pos,
                        reason: reason.to_string(),
                        sell_fraction,
                    })
                    .await;
                return DispatchOutcome::Failed(e);
            }
        };

        self.confirm(position_id, decision, &reason, sell_fraction, receipt)
            .await
    }

    /// Quote + swap, retried with exponential backoff for retriable failures.
    /// One attempt covers both legs; a stale quote is re-fetched on retry.
    #[allow(clippy::too_many_arguments)]
    async fn sell_with_retries(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: f64,
        slippage_bps: u32,
        priority_fee: u64,
        max_attempts: u32,
        backoff_base_ms: u64,
    ) -> Result<SwapReceipt, EngineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let result = async {
                let quote = self
                    .swap
                    .get_quote(input_mint, output_mint, amount, slippage_bps)
                    .await?;
                self.swap.execute_swap(&quote, priority_fee).await
            }
            .await;

            match result {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    // Exponent capped so a misconfigured attempt count can
                    // never overflow the shift.
                    let delay = backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay,
                        error = %e,
                        "sell attempt failed — backing off"
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply the confirmed sell to the registry, persist, and notify.
    async fn confirm(
        &self,
        position_id: Uuid,
        decision: &ExitDecision,
        reason: &ExitReason,
        sell_fraction: f64,
        receipt: SwapReceipt,
    ) -> DispatchOutcome {
        let proceeds = receipt.output_amount;
        let closed = decision.closes_position();

        let applied = if closed {
            self.state
                .registry
                .apply_full_exit(position_id, proceeds, reason)
        } else {
            self.state
                .registry
                .apply_partial_exit(position_id, sell_fraction, proceeds, reason)
        };

        let position = match applied {
            Ok(p) => p,
            Err(e) => {
                // The swap confirmed but the registry refused the mutation.
                // Surfaced loudly; never clamped or papered over.
                error!(
                    id = %position_id,
                    signature = %receipt.signature,
                    error = %e,
                    "confirmed sell could not be applied"
                );
                return DispatchOutcome::Failed(e);
            }
        };

        self.state
            .counters
            .sells_executed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        info!(
            id = %position_id,
            reason = %reason,
            signature = %receipt.signature,
            proceeds,
            closed,
            remaining = position.remaining_amount,
            "exit confirmed"
        );

        let pnl_percent = if position.invested > 0.0 {
            position.realized_pnl / position.invested * 100.0
        } else {
            0.0
        };

        self.state
            .sink
            .emit(crate::notify::SinkEvent::SellExecuted {
                position: position.clone(),
                reason: reason.to_string(),
                pnl_percent,
                sell_fraction,
            })
            .await;

        if closed {
            self.state
                .sink
                .emit(crate::notify::SinkEvent::PositionClosed {
                    position,
                    reason: reason.to_string(),
                    pnl_percent,
                })
                .await;
        }

        self.state.persist_positions();
        DispatchOutcome::Executed { closed }
    }
}

// =============================================================================
// Tests
// =============================================================================
