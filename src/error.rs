// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Errors fall into three propagation classes:
//
//   * `Configuration` — fatal at startup, aborts the whole engine.
//   * `QuoteUnavailable` / `Network` / `NoRoute` / `SlippageExceeded` /
//     `InsufficientFunds` / `NoData` — scoped to a single position's network
//     calls; retried with bounded backoff and then surfaced through the
//     notification sink, never propagated to other positions.
//   * `DataInconsistency` / `DuplicateActivePosition` / `PositionNotFound` —
//     registry-level rejections. `DataInconsistency` means a mutation would
//     drive the remaining amount negative; the mutation is refused outright,
//     never clamped.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid startup configuration. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The swap service returned no usable quote after all retries.
    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),

    /// The swap service found no route between the two assets.
    #[error("no route: {0}")]
    NoRoute(String),

    /// A network-level failure talking to an external service.
    #[error("network error: {0}")]
    Network(String),

    /// The swap executed outside the allowed slippage tolerance.
    #[error("slippage exceeded: {0}")]
    SlippageExceeded(String),

    /// The wallet lacked the funds to execute the swap.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The price oracle has no data for the requested asset.
    #[error("no price data for {0}")]
    NoData(String),

    /// A mutation would drive the remaining amount negative. Critical —
    /// refused, never clamped.
    #[error("data inconsistency on position {position_id}: {detail}")]
    DataInconsistency { position_id: String, detail: String },

    /// An active position already exists for this mint.
    #[error("active position already exists for mint {0}")]
    DuplicateActivePosition(String),

    /// No position with the given id is known to the registry.
    #[error("position {0} not found")]
    PositionNotFound(String),
}

impl EngineError {
    /// Whether this failure class is worth another attempt after backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::QuoteUnavailable(_)
                | Self::NoRoute(_)
                | Self::Network(_)
                | Self::SlippageExceeded(_)
        )
    }

    /// Short machine-readable label used in sink events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::QuoteUnavailable(_) => "QuoteUnavailable",
            Self::NoRoute(_) => "NoRoute",
            Self::Network(_) => "NetworkError",
            Self::SlippageExceeded(_) => "SlippageExceeded",
            Self::InsufficientFunds(_) => "InsufficientFunds",
            Self::NoData(_) => "NoData",
            Self::DataInconsistency { .. } => "DataInconsistency",
            Self::DuplicateActivePosition(_) => "DuplicateActivePosition",
            Self::PositionNotFound(_) => "PositionNotFound",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
