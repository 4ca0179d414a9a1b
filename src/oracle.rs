// =============================================================================
// Price Oracle client
// =============================================================================
//
// Read-only HTTP client for the external price oracle. One lookup per active
// position per poll tick; lookups are independent and carry a bounded timeout
// so a hung request for one mint never delays another position's poller.
//
// The `PriceSource` trait is the seam the poll loop is written against, so
// tests can substitute a scripted source.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::EngineError;

/// A single price observation.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PriceQuote {
    /// Price of the asset in base-currency units.
    pub price: f64,
    /// Liquidity backing the quote, in base-currency units.
    #[serde(default)]
    pub liquidity: f64,
}

/// Anything that can answer "what is this mint worth right now".
pub trait PriceSource: Send + Sync + 'static {
    fn get_price(
        &self,
        mint: &str,
    ) -> impl Future<Output = Result<PriceQuote, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP price-oracle client (`GET {base}/price/{mint}`).
#[derive(Clone)]
pub struct HttpPriceOracle {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPriceOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

impl PriceSource for HttpPriceOracle {
    async fn get_price(&self, mint: &str) -> Result<PriceQuote, EngineError> {
        let url = format!("{}/price/{}", self.base_url, mint);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("price lookup failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NoData(mint.to_string()));
        }
        if !resp.status().is_success() {
            return Err(EngineError::Network(format!(
                "oracle returned {} for {mint}",
                resp.status()
            )));
        }

        let quote: PriceQuote = resp
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("bad oracle response: {e}")))?;

        if quote.price <= 0.0 {
            return Err(EngineError::NoData(mint.to_string()));
        }

        debug!(mint, price = quote.price, liquidity = quote.liquidity, "price fetched");
        Ok(quote)
    }
}

impl std::fmt::Debug for HttpPriceOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPriceOracle")
            .field("base_url", &self.base_url)
            .finish()
    }
}
