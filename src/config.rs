// =============================================================================
// Engine Configuration — JSON file + environment overrides, atomic save
// =============================================================================
//
// Every tunable parameter of the exit engine lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash, and all fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// Validation runs once at startup; a bad config is fatal (the engine refuses
// to start rather than run with nonsense thresholds).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_base_mint() -> String {
    // USDC — the quote side of every exit swap.
    "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_oracle_url() -> String {
    "http://127.0.0.1:8899/oracle".to_string()
}

fn default_swap_url() -> String {
    "http://127.0.0.1:8899/swap".to_string()
}

fn default_snapshot_path() -> String {
    "positions.json".to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_slippage_bps() -> u32 {
    100
}

fn default_priority_fee_lamports() -> u64 {
    5_000
}

fn default_max_sell_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_single_position_pct() -> f64 {
    0.05
}

fn default_max_portfolio_exposure_pct() -> f64 {
    0.25
}

fn default_min_position_size() -> f64 {
    10.0
}

fn default_stop_loss_pct() -> f64 {
    0.15
}

fn default_emergency_stop_pct() -> f64 {
    0.40
}

fn default_take_profit_pct() -> f64 {
    1.00
}

fn default_trailing_activation_pct() -> f64 {
    0.50
}

fn default_trailing_distance() -> f64 {
    0.30
}

fn default_ladder() -> Vec<LadderRung> {
    vec![
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
    ]
}

// =============================================================================
// SizingParams
// =============================================================================

/// One rung of the partial take-profit ladder: at `gain_pct` unrealised gain,
/// sell `sell_fraction` of the then-remaining amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderRung {
    pub gain_pct: f64,
    pub sell_fraction: f64,
}

/// Tunable parameters for position sizing and the exit-threshold set derived
/// at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingParams {
    /// Maximum single position as a fraction of wallet balance.
    #[serde(default = "default_max_single_position_pct")]
    pub max_single_position_pct: f64,

    /// Maximum total portfolio exposure as a fraction of wallet balance.
    #[serde(default = "default_max_portfolio_exposure_pct")]
    pub max_portfolio_exposure_pct: f64,

    /// Minimum viable position size in base-currency units.
    #[serde(default = "default_min_position_size")]
    pub min_position_size: f64,

    /// Base stop-loss distance below entry (fraction, e.g. 0.15 = -15 %).
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Emergency-stop drawdown (fraction, e.g. 0.40 = -40 %). Always wider
    /// than the stop-loss; fires first when both are breached.
    #[serde(default = "default_emergency_stop_pct")]
    pub emergency_stop_pct: f64,

    /// Full take-profit gain above entry (fraction, e.g. 1.0 = +100 %).
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Unrealised gain at which the trailing stop arms.
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: f64,

    /// Pullback from the highest observed price that fires the trailing stop.
    #[serde(default = "default_trailing_distance")]
    pub trailing_distance: f64,

    /// Partial take-profit ladder, ascending by gain.
    #[serde(default = "default_ladder")]
    pub ladder: Vec<LadderRung>,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            max_single_position_pct: default_max_single_position_pct(),
            max_portfolio_exposure_pct: default_max_portfolio_exposure_pct(),
            min_position_size: default_min_position_size(),
            stop_loss_pct: default_stop_loss_pct(),
            emergency_stop_pct: default_emergency_stop_pct(),
            take_profit_pct: default_take_profit_pct(),
            trailing_activation_pct: default_trailing_activation_pct(),
            trailing_distance: default_trailing_distance(),
            ladder: default_ladder(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Vanta exit engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- External services ---------------------------------------------------
    /// Base URL of the price oracle.
    #[serde(default = "default_oracle_url")]
    pub oracle_url: String,

    /// Base URL of the swap execution service.
    #[serde(default = "default_swap_url")]
    pub swap_url: String,

    /// Optional HTTP endpoint for the notification sink. `None` means
    /// log-only delivery.
    #[serde(default)]
    pub sink_url: Option<String>,

    /// Mint of the base currency every exit swaps into.
    #[serde(default = "default_base_mint")]
    pub base_mint: String,

    // --- Server --------------------------------------------------------------
    /// Bind address for the webhook + operator API server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Timing --------------------------------------------------------------
    /// Price-poll interval per active position, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Interval between periodic position snapshots, in seconds.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Timeout applied to every outbound HTTP request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Execution -----------------------------------------------------------
    /// Slippage tolerance for exit swaps, in basis points.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,

    /// Priority fee attached to swap submissions, in lamports.
    #[serde(default = "default_priority_fee_lamports")]
    pub priority_fee_lamports: u64,

    /// Attempts per network step (quote, swap) before a sell is reported
    /// failed.
    #[serde(default = "default_max_sell_attempts")]
    pub max_sell_attempts: u32,

    /// Base delay for exponential retry backoff, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    // --- Persistence ---------------------------------------------------------
    /// Path of the durable position snapshot file.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    // --- Sizing & thresholds -------------------------------------------------
    #[serde(default)]
    pub sizing: SizingParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            oracle_url: default_oracle_url(),
            swap_url: default_swap_url(),
            sink_url: None,
            base_mint: default_base_mint(),
            bind_addr: default_bind_addr(),
            poll_interval_secs: default_poll_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            slippage_bps: default_slippage_bps(),
            priority_fee_lamports: default_priority_fee_lamports(),
            max_sell_attempts: default_max_sell_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            snapshot_path: default_snapshot_path(),
            sizing: SizingParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            oracle_url = %config.oracle_url,
            swap_url = %config.swap_url,
            poll_interval_secs = config.poll_interval_secs,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides (VANTA_*). Called once at startup
    /// after loading the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VANTA_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("VANTA_ORACLE_URL") {
            self.oracle_url = v;
        }
        if let Ok(v) = std::env::var("VANTA_SWAP_URL") {
            self.swap_url = v;
        }
        if let Ok(v) = std::env::var("VANTA_SINK_URL") {
            if !v.is_empty() {
                self.sink_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("VANTA_SNAPSHOT_PATH") {
            self.snapshot_path = v;
        }
    }

    /// Validate the configuration. Any violation here is fatal at startup.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.oracle_url.is_empty() {
            return Err(EngineError::Configuration("oracle_url is empty".into()));
        }
        if self.swap_url.is_empty() {
            return Err(EngineError::Configuration("swap_url is empty".into()));
        }
        if self.base_mint.is_empty() {
            return Err(EngineError::Configuration("base_mint is empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(EngineError::Configuration(
                "poll_interval_secs must be > 0".into(),
            ));
        }
        if !(1..=10).contains(&self.max_sell_attempts) {
            return Err(EngineError::Configuration(
                "max_sell_attempts must be between 1 and 10".into(),
            ));
        }

        let s = &self.sizing;
        if !(0.0 < s.max_single_position_pct && s.max_single_position_pct <= 1.0) {
            return Err(EngineError::Configuration(
                "max_single_position_pct must be in (0, 1]".into(),
            ));
        }
        if !(0.0 < s.max_portfolio_exposure_pct && s.max_portfolio_exposure_pct <= 1.0) {
            return Err(EngineError::Configuration(
                "max_portfolio_exposure_pct must be in (0, 1]".into(),
            ));
        }
        if s.stop_loss_pct <= 0.0 || s.emergency_stop_pct <= s.stop_loss_pct {
            return Err(EngineError::Configuration(
                "emergency_stop_pct must exceed stop_loss_pct, both positive".into(),
            ));
        }
        if s.trailing_distance <= 0.0 || s.trailing_distance >= 1.0 {
            return Err(EngineError::Configuration(
                "trailing_distance must be in (0, 1)".into(),
            ));
        }
        if s.ladder.is_empty() {
            return Err(EngineError::Configuration("ladder is empty".into()));
        }
        let mut prev_gain = 0.0;
        for (i, rung) in s.ladder.iter().enumerate() {
            if rung.gain_pct <= prev_gain {
                return Err(EngineError::Configuration(format!(
                    "ladder rung {i} not ascending by gain"
                )));
            }
            if !(0.0 < rung.sell_fraction && rung.sell_fraction <= 1.0) {
                return Err(EngineError::Configuration(format!(
                    "ladder rung {i} sell_fraction must be in (0, 1]"
                )));
            }
            prev_gain = rung.gain_pct;
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
