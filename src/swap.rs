// =============================================================================
// Swap Execution Service client — quote + swap over HTTP
// =============================================================================
//
// Two-step execution against an external aggregator:
//
//   1. `GET {base}/quote` — price a sell of `amount` tokens into the base
//      currency at a slippage tolerance.
//   2. `POST {base}/swap` — submit the quoted swap with a priority fee and
//      wait for confirmation.
//
// Failures are mapped onto the engine taxonomy so the dispatcher can decide
// what to retry: service error codes become `NoRoute` / `SlippageExceeded` /
// `InsufficientFunds`; transport problems become `Network`.
//
// The `SwapService` trait is the seam the dispatcher is written against, so
// tests can script quote/swap outcomes without a live service.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A priced route for one sell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    /// Tokens going in.
    pub in_amount: f64,
    /// Base-currency units coming out at the quoted route.
    pub out_amount: f64,
    /// Estimated price impact, as a fraction.
    #[serde(default)]
    pub price_impact_pct: f64,
}

/// Confirmation of an executed swap.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapReceipt {
    /// Transaction signature.
    pub signature: String,
    /// Base-currency units actually received.
    pub output_amount: f64,
}

/// Error body the swap service returns on 4xx/5xx.
#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Anything that can price and execute an exit swap.
pub trait SwapService: Send + Sync + 'static {
    fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: f64,
        slippage_bps: u32,
    ) -> impl Future<Output = Result<Quote, EngineError>> + Send;

    fn execute_swap(
        &self,
        quote: &Quote,
        priority_fee_lamports: u64,
    ) -> impl Future<Output = Result<SwapReceipt, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for the swap execution service.
#[derive(Clone)]
pub struct HttpSwapClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    quote: &'a Quote,
    priority_fee_lamports: u64,
}

impl HttpSwapClient {
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

    /// Map a non-success response onto the engine error taxonomy.
    async fn classify_failure(resp: reqwest::Response) -> EngineError {
        let status = resp.status();
        let body: ServiceError = resp.json().await.unwrap_or(ServiceError {
            code: String::new(),
            message: format!("status {status}"),
        });

        match body.code.as_str() {
            "NO_ROUTE" => EngineError::NoRoute(body.message),
            "SLIPPAGE_EXCEEDED" => EngineError::SlippageExceeded(body.message),
            "INSUFFICIENT_FUNDS" => EngineError::InsufficientFunds(body.message),
            _ if status.is_server_error() => {
                EngineError::Network(format!("swap service {status}: {}", body.message))
            }
            _ => EngineError::QuoteUnavailable(format!("{status}: {}", body.message)),
        }
    }
}

impl SwapService for HttpSwapClient {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: f64,
        slippage_bps: u32,
    ) -> Result<Quote, EngineError> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, input_mint, output_mint, amount, slippage_bps
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("quote request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_failure(resp).await);
        }

        let quote: Quote = resp
            .json()
            .await
            .map_err(|e| EngineError::QuoteUnavailable(format!("bad quote response: {e}")))?;

        debug!(
            input_mint,
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            price_impact_pct = quote.price_impact_pct,
            "quote received"
        );
        Ok(quote)
    }

    async fn execute_swap(
        &self,
        quote: &Quote,
        priority_fee_lamports: u64,
    ) -> Result<SwapReceipt, EngineError> {
        let url = format!("{}/swap", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(&SwapRequest {
                quote,
                priority_fee_lamports,
            })
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("swap submit failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::classify_failure(resp).await);
        }

        let receipt: SwapReceipt = resp
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("bad swap response: {e}")))?;

        debug!(
            signature = %receipt.signature,
            output_amount = receipt.output_amount,
            "swap confirmed"
        );
        Ok(receipt)
    }
}

impl std::fmt::Debug for HttpSwapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSwapClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_wire_format_is_camel_case() {
        let json = r#"{
            "inputMint": "MINT",
            "outputMint": "USDC",
            "inAmount": 30.0,
            "outAmount": 34.8,
            "priceImpactPct": 0.002
        }"#;
        let quote: Quote = serde_json::from_str(json).unwrap();
        assert_eq!(quote.input_mint, "MINT");
        assert!((quote.out_amount - 34.8).abs() < 1e-12);
    }

    #[test]
    fn receipt_parses_without_optional_fields() {
        let json = r#"{ "signature": "5abc", "outputAmount": 12.5 }"#;
        let receipt: SwapReceipt = serde_json::from_str(json).unwrap();
        assert_eq!(receipt.signature, "5abc");
        assert!((receipt.output_amount - 12.5).abs() < 1e-12);
    }
}
