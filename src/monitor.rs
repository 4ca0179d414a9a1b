// =============================================================================
// Position monitor — one worker task per position
// =============================================================================
//
// Each active position gets exactly one worker consuming its event channel
// and one price poller feeding it. The worker is the only caller of
// evaluate/dispatch for its position, so trigger handling is serialized per
// position by construction while positions run concurrently.
//
// Event handling drains the channel before evaluating: a burst of updates
// coalesces into one evaluation of the latest state rather than a queue of
// obsolete decisions.
//
// After a confirmed partial exit the worker re-evaluates immediately, so a
// price that crosses several ladder rungs at once executes them one confirmed
// sell at a time, each against the then-current remainder.
// =============================================================================

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::evaluator::{evaluate, ExitDecision};
use crate::ingest;
use crate::oracle::PriceSource;
use crate::state::EngineState;
use crate::swap::SwapService;
use crate::types::TriggerEvent;

/// Spawn the worker and poller pair for a position. Call once per
/// registration (and once per active position on restore).
pub fn launch_position<S: SwapService, O: PriceSource>(
    state: &Arc<EngineState>,
    dispatcher: &Arc<Dispatcher<S>>,
    oracle: &Arc<O>,
    position_id: Uuid,
    mint: String,
) {
    let rx = state.router.register(position_id);
    tokio::spawn(run_position_worker(
        state.clone(),
        dispatcher.clone(),
        position_id,
        rx,
    ));
    tokio::spawn(ingest::run_price_poller(
        state.clone(),
        oracle.clone(),
        position_id,
        mint,
    ));
}

/// Consume a position's event channel until the position closes or the
/// channel is torn down.
pub async fn run_position_worker<S: SwapService>(
    state: Arc<EngineState>,
    dispatcher: Arc<Dispatcher<S>>,
    position_id: Uuid,
    mut rx: mpsc::Receiver<TriggerEvent>,
) {
    info!(id = %position_id, "position worker started");

    while let Some(event) = rx.recv().await {
        let mut applied = apply_counted(&state, &event);

        // Drain whatever queued up while we were waiting; the registry's
        // timestamp gating keeps only the newest state.
        while let Ok(next) = rx.try_recv() {
            applied |= apply_counted(&state, &next);
        }

        if !applied {
            continue;
        }

        if !run_trigger_cycle(&state, &dispatcher, position_id).await {
            break;
        }
    }

    state.router.remove(position_id);
    info!(id = %position_id, "position worker stopped");
}

/// Apply one event, counting discards. Returns whether state changed.
fn apply_counted(state: &EngineState, event: &TriggerEvent) -> bool {
    let applied = state.registry.apply_update(event);
    if !applied {
        state
            .counters
            .stale_events_discarded
            .fetch_add(1, Ordering::Relaxed);
    }
    applied
}

/// Evaluate and dispatch until the position settles. Returns `false` once
/// the position has closed and the worker should exit.
async fn run_trigger_cycle<S: SwapService>(
    state: &Arc<EngineState>,
    dispatcher: &Arc<Dispatcher<S>>,
    position_id: Uuid,
) -> bool {
    loop {
        let Some(pos) = state.registry.snapshot(position_id) else {
            return false;
        };
        if !pos.active {
            return false;
        }

        let decision = evaluate(&pos);
        if matches!(decision, ExitDecision::None) {
            return true;
        }

        debug!(id = %position_id, ?decision, "trigger matched");

        match dispatcher.execute(position_id, &decision).await {
            DispatchOutcome::Executed { closed: true } => return false,
            // A confirmed partial changes the remainder; re-evaluate so the
            // next ladder rung (if also crossed) fires against it.
            DispatchOutcome::Executed { closed: false } => continue,
            // Failed or skipped: stop here, the next event retries naturally.
            DispatchOutcome::Failed(_) | DispatchOutcome::Skipped => return true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{sleep, Duration};

    use crate::config::{EngineConfig, LadderRung};
    use crate::error::EngineError;
    use crate::registry::ExitThresholds;
    use crate::swap::{Quote, SwapReceipt};

    /// Scripted swap: first `fail_first` quotes fail retriably, then every
    /// exit fills at `exit_price`.
    struct ScriptedSwap {
        fail_first: u32,
        exit_price: f64,
        quote_calls: AtomicU32,
        swap_calls: AtomicU32,
    }

    impl ScriptedSwap {
        fn new(fail_first: u32, exit_price: f64) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                exit_price,
                quote_calls: AtomicU32::new(0),
                swap_calls: AtomicU32::new(0),
            })
        }
    }

    impl SwapService for ScriptedSwap {
        async fn get_quote(
            &self,
            input_mint: &str,
            output_mint: &str,
            amount: f64,
            _slippage_bps: u32,
        ) -> Result<Quote, EngineError> {
            let n = self.quote_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(EngineError::QuoteUnavailable("aggregator timeout".into()));
            }
            Ok(Quote {
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                in_amount: amount,
                out_amount: amount * self.exit_price,
                price_impact_pct: 0.0,
            })
        }

        async fn execute_swap(
            &self,
            quote: &Quote,
            _priority_fee_lamports: u64,
        ) -> Result<SwapReceipt, EngineError> {
            self.swap_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SwapReceipt {
                signature: format!("sig-{}", self.swap_calls.load(Ordering::SeqCst)),
                output_amount: quote.out_amount,
            })
        }
    }

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
                LadderRung {
                    gain_pct: 0.50,
                    sell_fraction: 1.00,
                },
            ],
        }
    }

    fn test_state() -> Arc<EngineState> {
        let mut cfg = EngineConfig::default();
        cfg.backoff_base_ms = 1;
        cfg.snapshot_path = std::env::temp_dir()
            .join(format!("vanta-monitor-{}.json", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        Arc::new(EngineState::new(cfg))
    }

    /// Register a position and spawn its worker (no poller; tests publish
    /// events directly).
    fn launch(state: &Arc<EngineState>, swap: &Arc<ScriptedSwap>) -> Uuid {
        let id = state
            .registry
            .register("MINT", 1.0, 100.0, 100.0, thresholds())
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(state.clone(), swap.clone()));
        let rx = state.router.register(id);
        tokio::spawn(run_position_worker(state.clone(), dispatcher, id, rx));
        id
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn stop_loss_after_transient_failures_executes_once() {
        let state = test_state();
        let swap = ScriptedSwap::new(2, 0.84);
        let id = launch(&state, &swap);

        assert!(
            state
                .router
                .publish(TriggerEvent::Price {
                    position_id: id,
                    price: 0.84,
                    ts: 10,
                })
                .await
        );

        let reg = state.registry.clone();
        wait_until(|| !reg.is_active(id)).await;

        // Two failed attempts, one confirmed execution.
        assert_eq!(swap.quote_calls.load(Ordering::SeqCst), 3);
        assert_eq!(swap.swap_calls.load(Ordering::SeqCst), 1);

        let pos = state.registry.snapshot(id).unwrap();
        assert_eq!(pos.exit_reason, Some(crate::types::ExitReason::StopLoss));
        assert!((pos.realized_pnl - (-16.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_price_event_executes_once() {
        let state = test_state();
        let swap = ScriptedSwap::new(0, 0.80);
        let id = launch(&state, &swap);

        let event = TriggerEvent::Price {
            position_id: id,
            price: 0.80,
            ts: 10,
        };
        // Webhook redelivery: identical payload, identical timestamp.
        state.router.publish(event.clone()).await;
        state.router.publish(event).await;

        let reg = state.registry.clone();
        wait_until(|| !reg.is_active(id)).await;
        // Give the worker a beat in case the duplicate arrived second.
        sleep(Duration::from_millis(20)).await;

        assert_eq!(swap.swap_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.counters.stale_events_discarded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn jump_across_two_rungs_executes_sequentially() {
        let state = test_state();
        let swap = ScriptedSwap::new(0, 1.30);
        let id = launch(&state, &swap);

        // +30 % crosses the first two rungs but not the third.
        state
            .router
            .publish(TriggerEvent::Price {
                position_id: id,
                price: 1.30,
                ts: 10,
            })
            .await;

        let reg = state.registry.clone();
        wait_until(|| {
            reg.snapshot(id)
                .map(|p| p.fired.len() == 2)
                .unwrap_or(false)
        })
        .await;

        let pos = state.registry.snapshot(id).unwrap();
        assert!(pos.active);
        // 100 -> sell 30 % (30) -> sell 50 % of 70 (35) -> 35 left.
        assert!((pos.remaining_amount - 35.0).abs() < 1e-9);
        assert_eq!(swap.swap_calls.load(Ordering::SeqCst), 2);
        assert!(pos
            .fired
            .contains(&crate::types::TriggerKey::PartialTakeProfit(0)));
        assert!(pos
            .fired
            .contains(&crate::types::TriggerKey::PartialTakeProfit(1)));
    }

    #[tokio::test]
    async fn rising_price_walks_the_ladder_and_closes_at_final_rung() {
        let state = test_state();
        let swap = ScriptedSwap::new(0, 1.55);
        let id = launch(&state, &swap);

        for (i, price) in [1.16, 1.26, 1.55].iter().enumerate() {
            state
                .router
                .publish(TriggerEvent::Price {
                    position_id: id,
                    price: *price,
                    ts: (i as i64 + 1) * 10,
                })
                .await;
            // Let each observation settle so rungs fire one at a time.
            sleep(Duration::from_millis(30)).await;
        }

        let reg = state.registry.clone();
        wait_until(|| !reg.is_active(id)).await;

        // The final rung sells 100 % of the remainder and closes the position.
        let pos = state.registry.snapshot(id).unwrap();
        assert_eq!(pos.remaining_amount, 0.0);
        assert_eq!(swap.swap_calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            pos.exit_reason,
            Some(crate::types::ExitReason::PartialTakeProfit { level: 2, .. })
        ));
    }

    #[tokio::test]
    async fn worker_ignores_events_that_trigger_nothing() {
        let state = test_state();
        let swap = ScriptedSwap::new(0, 1.0);
        let id = launch(&state, &swap);

        state
            .router
            .publish(TriggerEvent::Price {
                position_id: id,
                price: 1.05,
                ts: 10,
            })
            .await;
        sleep(Duration::from_millis(30)).await;

        assert!(state.registry.is_active(id));
        assert_eq!(swap.quote_calls.load(Ordering::SeqCst), 0);
        let pos = state.registry.snapshot(id).unwrap();
        assert!((pos.current_price - 1.05).abs() < 1e-12);
    }
}
