// =============================================================================
// HTTP surface — Axum 0.8
// =============================================================================
//
// All endpoints live under `/api/v1/`. Three tiers:
//
//   * Public: health.
//   * Webhook: the push ingest endpoint, authenticated by an HMAC-SHA256
//     signature over the raw body (`X-Signature` header, hex) keyed on
//     `VANTA_WEBHOOK_SECRET`.
//   * Operator: position registration and inspection, authenticated by a
//     Bearer token checked against `VANTA_ADMIN_TOKEN` in constant time.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Json, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::ingest::{self, PushPayload};
use crate::monitor;
use crate::notify::SinkEvent;
use crate::oracle::PriceSource;
use crate::registry::Position;
use crate::sizing;
use crate::state::EngineState;
use crate::swap::SwapService;

type HmacSha256 = Hmac<Sha256>;

/// Slack allowed between the risk-sized allocation and the capital an
/// operator-reported fill actually spent, as a fraction. Covers fees and
/// price drift between sizing and execution.
const FILL_TOLERANCE: f64 = 0.05;

// =============================================================================
// Shared context
// =============================================================================

/// Everything the handlers need: engine state plus the concrete swap and
/// oracle services for launching new position tasks.
pub struct ApiContext<S: SwapService, O: PriceSource> {
    pub state: Arc<EngineState>,
    pub dispatcher: Arc<Dispatcher<S>>,
    pub oracle: Arc<O>,
}

impl<S: SwapService, O: PriceSource> Clone for ApiContext<S, O> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            dispatcher: self.dispatcher.clone(),
            oracle: self.oracle.clone(),
        }
    }
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router.
pub fn router<S: SwapService, O: PriceSource>(ctx: ApiContext<S, O>) -> Router {
    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Push ingest ─────────────────────────────────────────────
        .route("/api/v1/webhook", post(webhook::<S, O>))
        // ── Operator ────────────────────────────────────────────────
        .route("/api/v1/positions", post(open_position::<S, O>))
        .route("/api/v1/positions", get(active_positions::<S, O>))
        .route("/api/v1/positions/closed", get(closed_positions::<S, O>))
        .route("/api/v1/stats", get(stats::<S, O>))
        .with_state(ctx)
}

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Always examines every byte even
/// after a mismatch is found.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Bearer auth extractor
// =============================================================================

/// Axum extractor validating `Authorization: Bearer <token>` against the
/// `VANTA_ADMIN_TOKEN` environment variable. Read per request so token
/// rotation does not require a restart. Carries no data; handlers take it
/// purely as an authentication gate.
pub struct AuthBearer;

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("VANTA_ADMIN_TOKEN").unwrap_or_default();

        if expected.is_empty() {
            warn!("VANTA_ADMIN_TOKEN is not set, rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer)
    }
}

// =============================================================================
// Webhook signature
// =============================================================================

/// Verify a hex HMAC-SHA256 signature over the raw request body.
fn verify_webhook_signature(secret: &str, signature_hex: &str, body: &[u8]) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // verify_slice is constant-time internally.
    mac.verify_slice(&signature).is_ok()
}

/// Webhook bodies arrive either as a single payload or as a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum WebhookBody {
    Batch(Vec<PushPayload>),
    Single(PushPayload),
}

impl WebhookBody {
    fn into_payloads(self) -> Vec<PushPayload> {
        match self {
            Self::Batch(v) => v,
            Self::Single(p) => vec![p],
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

/// Push ingest. Always acknowledges authenticated deliveries with 202; a
/// payload the engine does not consume is counted, not rejected, so the
/// provider never retries what we chose to ignore.
async fn webhook<S: SwapService, O: PriceSource>(
    State(ctx): State<ApiContext<S, O>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = std::env::var("VANTA_WEBHOOK_SECRET").unwrap_or_default();
    if secret.is_empty() {
        warn!("VANTA_WEBHOOK_SECRET is not set, rejecting webhook delivery");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Webhook authentication not configured" })),
        )
            .into_response();
    }

    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_webhook_signature(&secret, signature, &body) {
        warn!("webhook delivery with bad signature rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid signature" })),
        )
            .into_response();
    }

    let payloads = match serde_json::from_slice::<WebhookBody>(&body) {
        Ok(parsed) => parsed.into_payloads(),
        Err(e) => {
            warn!(error = %e, "unparseable webhook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "Malformed payload" })),
            )
                .into_response();
        }
    };

    let mut accepted = 0usize;
    for payload in &payloads {
        match ingest::canonicalize_push(&ctx.state, payload) {
            Some(event) => {
                if ctx.state.router.publish(event).await {
                    accepted += 1;
                }
            }
            None => {
                ctx.state
                    .counters
                    .pushes_ignored
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "received": payloads.len(), "accepted": accepted })),
    )
        .into_response()
}

/// A confirmed buy to bring under management.
#[derive(Debug, Deserialize)]
pub struct OpenPositionRequest {
    pub mint: String,
    /// Asset risk score in [0, 100]; higher is riskier.
    pub risk_score: f64,
    /// Wallet balance in base currency at decision time.
    pub wallet_balance: f64,
    pub entry_price: f64,
    /// Tokens actually received by the entry fill.
    pub filled_amount: f64,
    /// Base currency actually spent.
    pub invested: f64,
}

#[derive(Debug)]
enum OpenError {
    Rejected(String),
    Duplicate(String),
    Invalid(String),
}

impl IntoResponse for OpenError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Rejected(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            Self::Duplicate(m) => (StatusCode::CONFLICT, m),
            Self::Invalid(m) => (StatusCode::BAD_REQUEST, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

async fn open_position<S: SwapService, O: PriceSource>(
    _auth: AuthBearer,
    State(ctx): State<ApiContext<S, O>>,
    Json(req): Json<OpenPositionRequest>,
) -> Result<impl IntoResponse, OpenError> {
    let position = register_position(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(position)))
}

/// Size, register, and launch a new position. Factored out of the handler so
/// it can be exercised without an HTTP stack.
async fn register_position<S: SwapService, O: PriceSource>(
    ctx: &ApiContext<S, O>,
    req: OpenPositionRequest,
) -> Result<Position, OpenError> {
    if req.entry_price <= 0.0 || req.filled_amount <= 0.0 || req.invested <= 0.0 {
        return Err(OpenError::Invalid(
            "entry_price, filled_amount, and invested must be positive".into(),
        ));
    }

    let (sizing_params, exposure) = {
        let cfg = ctx.state.config.read();
        (cfg.sizing.clone(), ctx.state.registry.current_exposure())
    };

    let Some(sized) = sizing::size(req.risk_score, req.wallet_balance, exposure, &sizing_params)
    else {
        info!(
            mint = %req.mint,
            risk_score = req.risk_score,
            wallet_balance = req.wallet_balance,
            exposure,
            "position rejected by risk sizing"
        );
        return Err(OpenError::Rejected(
            "position rejected by risk sizing".into(),
        ));
    };

    // The fill must respect the sized allocation. Accepting an arbitrary
    // invested amount here would let a single fill blow past both the
    // single-position and portfolio exposure caps the sizing just computed.
    let allowed = sized.position_size * (1.0 + FILL_TOLERANCE);
    if req.invested > allowed {
        warn!(
            mint = %req.mint,
            invested = req.invested,
            sized = sized.position_size,
            "fill exceeds sized allocation, rejected"
        );
        return Err(OpenError::Rejected(format!(
            "invested {} exceeds the sized allocation of {:.2}",
            req.invested, sized.position_size
        )));
    }

    let thresholds = sized.thresholds_at(req.entry_price);
    let id = ctx
        .state
        .registry
        .register(
            &req.mint,
            req.entry_price,
            req.filled_amount,
            req.invested,
            thresholds,
        )
        .map_err(|e| match e {
            EngineError::DuplicateActivePosition(mint) => {
                OpenError::Duplicate(format!("active position already exists for mint {mint}"))
            }
            other => OpenError::Invalid(other.to_string()),
        })?;

    monitor::launch_position(&ctx.state, &ctx.dispatcher, &ctx.oracle, id, req.mint.clone());

    // snapshot(id) is Some by construction after a successful register.
    let position = ctx
        .state
        .registry
        .snapshot(id)
        .ok_or_else(|| OpenError::Invalid("position vanished after registration".into()))?;

    ctx.state
        .sink
        .emit(SinkEvent::PositionRegistered {
            position: position.clone(),
        })
        .await;
    ctx.state.persist_positions();

    Ok(position)
}

async fn active_positions<S: SwapService, O: PriceSource>(
    _auth: AuthBearer,
    State(ctx): State<ApiContext<S, O>>,
) -> impl IntoResponse {
    Json(ctx.state.registry.active_positions())
}

async fn closed_positions<S: SwapService, O: PriceSource>(
    _auth: AuthBearer,
    State(ctx): State<ApiContext<S, O>>,
) -> impl IntoResponse {
    Json(ctx.state.registry.closed_positions())
}

#[derive(Serialize)]
struct StatsResponse {
    uptime_secs: u64,
    active_positions: usize,
    closed_positions: usize,
    current_exposure: f64,
    counters: crate::state::CountersSnapshot,
}

async fn stats<S: SwapService, O: PriceSource>(
    _auth: AuthBearer,
    State(ctx): State<ApiContext<S, O>>,
) -> impl IntoResponse {
    Json(StatsResponse {
        uptime_secs: ctx.state.start_time.elapsed().as_secs(),
        active_positions: ctx.state.registry.active_positions().len(),
        closed_positions: ctx.state.registry.closed_positions().len(),
        current_exposure: ctx.state.registry.current_exposure(),
        counters: ctx.state.counters.snapshot(),
    })
}

// =============================================================================
// Tests
// =============================================================================
