// =============================================================================
// REST + SSE API Surface — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health, the SSE
// event stream) require no authentication. Every endpoint that reads or
// mutates trader/strategy/debate/backtest state requires a valid Bearer
// token, checked via the `AuthBearer` extractor.
//
// No business logic lives here: handlers only translate HTTP <-> the Store
// and the three managers (TraderManager, DebateManager, BacktestManager).
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::backtest::{BacktestConfig, BacktestManager, BacktestReport};
use crate::debate::{DebateManager, DebateSession, Participant};
use crate::events::{EventHub, HubEvent};
use crate::manager::TraderManager;
use crate::market_data::Candle;
use crate::persistence::store::{DecisionRecord, EquityRecord, Store, TradeRecord, TraderRecord};
use crate::persistence::{aggregate_trading_stats, TradingStats};
use crate::position::Position;
use crate::strategy_config::{Strategy, StrategyConfig};
use crate::types::{ExchangeKind, TraderStatus};

/// Shared state handed to every handler. Owns nothing itself beyond clones
/// of the long-lived handles assembled in `main`.
pub struct ApiState {
    pub store: Store,
    pub hub: EventHub,
    pub traders: Arc<TraderManager>,
    pub debates: Arc<DebateManager>,
    pub backtests: Arc<BacktestManager>,
}

type SharedState = Arc<ApiState>;

/// Build the full REST+SSE API router with CORS middleware and shared state.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/events", get(event_stream))
        // ── Strategies ──────────────────────────────────────────────
        .route("/api/v1/strategies", get(list_strategies).post(create_strategy))
        .route("/api/v1/strategies/:id", get(get_strategy))
        // ── Traders ──────────────────────────────────────────────────
        .route("/api/v1/traders", get(list_traders).post(create_trader))
        .route("/api/v1/traders/:id", get(get_trader))
        .route("/api/v1/traders/:id/start", post(start_trader))
        .route("/api/v1/traders/:id/stop", post(stop_trader))
        .route("/api/v1/traders/:id/positions", get(trader_positions))
        .route("/api/v1/traders/:id/decisions", get(trader_decisions))
        .route("/api/v1/traders/:id/trades", get(trader_trades))
        .route("/api/v1/traders/:id/equity", get(trader_equity))
        .route("/api/v1/traders/:id/stats", get(trader_stats))
        // ── Debate sessions ──────────────────────────────────────────
        .route("/api/v1/debates", get(list_debates).post(create_debate))
        .route("/api/v1/debates/:id", get(get_debate))
        .route("/api/v1/debates/:id/cancel", post(cancel_debate))
        // ── Backtest runs ─────────────────────────────────────────────
        .route("/api/v1/backtests", get(list_backtests).post(create_backtest))
        .route("/api/v1/backtests/:id", get(get_backtest))
        .route("/api/v1/backtests/:id/cancel", post(cancel_backtest))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running_traders: usize,
    server_time: i64,
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        running_traders: state.traders.running_ids().len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// SSE event stream (public — subscribers see a `sys` hello event first)
// =============================================================================

async fn event_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.hub.subscribe().await;
    let hello = stream::once(async { HubEvent::Sys { message: "connected".to_string() } });
    let rest = stream::unfold(subscription, |mut sub| async move {
        sub.rx.recv().await.map(|event| (event, sub))
    });
    let events = hello.chain(rest).map(|event| {
        Ok(Event::default().json_data(&event).unwrap_or_else(|_| Event::default().data("{}")))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// =============================================================================
// Strategies
// =============================================================================

async fn list_strategies(
    _auth: AuthBearer,
    State(state): State<SharedState>,
) -> Result<Json<Vec<Strategy>>, ApiError> {
    Ok(Json(state.store.list_strategies().await?))
}

#[derive(Deserialize)]
struct CreateStrategyRequest {
    name: String,
    #[serde(default)]
    config: Option<StrategyConfig>,
}

async fn create_strategy(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Json(req): Json<CreateStrategyRequest>,
) -> Result<Json<Strategy>, ApiError> {
    let strategy = Strategy::new(req.name, req.config.unwrap_or_default());
    state.store.save_strategy(&strategy).await?;
    info!(strategy_id = %strategy.id, "strategy created");
    Ok(Json(strategy))
}

async fn get_strategy(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Strategy>, ApiError> {
    state.store.get_strategy(id).await?.map(Json).ok_or(ApiError::NotFound("strategy"))
}

// =============================================================================
// Traders
// =============================================================================

/// API-facing trader view. Deliberately omits `api_key`/`api_secret` from
/// `TraderRecord` — never flatten the raw record into a response.
#[derive(Serialize)]
struct TraderView {
    id: Uuid,
    name: String,
    strategy_id: Uuid,
    exchange_kind: ExchangeKind,
    status: TraderStatus,
    initial_balance: f64,
    model_override: Option<String>,
    running: bool,
    last_error: Option<String>,
}

fn to_view(state: &ApiState, record: TraderRecord) -> TraderView {
    let running = state.traders.is_running(record.id);
    let last_error = state.traders.last_error(record.id);
    TraderView {
        id: record.id,
        name: record.name,
        strategy_id: record.strategy_id,
        exchange_kind: record.exchange_kind,
        status: record.status,
        initial_balance: record.initial_balance,
        model_override: record.model_override,
        running,
        last_error,
    }
}

async fn list_traders(
    _auth: AuthBearer,
    State(state): State<SharedState>,
) -> Result<Json<Vec<TraderView>>, ApiError> {
    let traders = state.store.list_traders().await?;
    Ok(Json(traders.into_iter().map(|t| to_view(&state, t)).collect()))
}

#[derive(Deserialize)]
struct CreateTraderRequest {
    name: String,
    strategy_id: Uuid,
    exchange_kind: ExchangeKind,
    initial_balance: f64,
    api_key: String,
    api_secret: String,
}

async fn create_trader(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Json(req): Json<CreateTraderRequest>,
) -> Result<Json<TraderView>, ApiError> {
    if state.store.get_strategy(req.strategy_id).await?.is_none() {
        return Err(ApiError::NotFound("strategy"));
    }
    let record = TraderRecord {
        id: Uuid::new_v4(),
        name: req.name,
        strategy_id: req.strategy_id,
        exchange_kind: req.exchange_kind,
        status: TraderStatus::Stopped,
        initial_balance: req.initial_balance,
        model_override: None,
        api_key: req.api_key,
        api_secret: req.api_secret,
    };
    state.store.save_trader(&record).await?;
    info!(trader_id = %record.id, "trader created");
    Ok(Json(to_view(&state, record)))
}

async fn get_trader(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TraderView>, ApiError> {
    let record = state.store.get_trader(id).await?.ok_or(ApiError::NotFound("trader"))?;
    Ok(Json(to_view(&state, record)))
}

async fn start_trader(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.traders.start(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_trader(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.traders.stop(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trader_positions(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<Vec<Position>> {
    Json(state.traders.positions(id))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn trader_decisions(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<DecisionRecord>>, ApiError> {
    Ok(Json(state.store.recent_decisions(id, q.limit.unwrap_or(100)).await?))
}

async fn trader_trades(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<TradeRecord>>, ApiError> {
    Ok(Json(state.store.recent_trades(id, q.limit.unwrap_or(100)).await?))
}

async fn trader_equity(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<EquityRecord>>, ApiError> {
    Ok(Json(state.store.recent_equity(id, q.limit.unwrap_or(1000)).await?))
}

async fn trader_stats(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TradingStats>, ApiError> {
    let mut trades = state.store.recent_trades(id, 1000).await?;
    let mut equity = state.store.recent_equity(id, 20_000).await?;
    equity.reverse();
    trades.reverse();
    Ok(Json(aggregate_trading_stats(&trades, &equity)))
}

// =============================================================================
// Debate sessions (ephemeral, in-memory only)
// =============================================================================

#[derive(Deserialize)]
struct CreateDebateRequest {
    symbols: Vec<String>,
    max_rounds: u32,
    participants: Vec<Participant>,
    account_equity: f64,
    /// The strategy whose system prompt (base instructions + custom prompt
    /// addendum) every participant debates under. Defaults to a plain
    /// strategy when the caller doesn't care to override it.
    #[serde(default)]
    strategy: StrategyConfig,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: Uuid,
}

async fn list_debates(_auth: AuthBearer, State(state): State<SharedState>) -> Json<Vec<DebateSession>> {
    Json(state.debates.list())
}

async fn create_debate(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Json(req): Json<CreateDebateRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    if req.participants.is_empty() {
        return Err(ApiError::BadRequest("at least one participant is required"));
    }
    let id = state
        .debates
        .start_session(req.symbols, req.max_rounds, req.participants, req.account_equity, req.strategy);
    info!(session_id = %id, "debate session started");
    Ok(Json(CreatedResponse { id }))
}

async fn get_debate(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DebateSession>, ApiError> {
    state.debates.get(id).map(Json).ok_or(ApiError::NotFound("debate session"))
}

async fn cancel_debate(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    state.debates.cancel(id);
    StatusCode::NO_CONTENT
}

// =============================================================================
// Backtest runs
// =============================================================================

#[derive(Deserialize)]
struct CreateBacktestRequest {
    config: BacktestConfig,
    strategy: StrategyConfig,
    candles: HashMap<String, Vec<Candle>>,
}

async fn list_backtests(_auth: AuthBearer, State(state): State<SharedState>) -> Json<Vec<BacktestReport>> {
    Json(state.backtests.list())
}

async fn create_backtest(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Json(req): Json<CreateBacktestRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    if req.config.symbols.is_empty() {
        return Err(ApiError::BadRequest("at least one symbol is required"));
    }
    let id = state.backtests.start(req.config, req.strategy, req.candles);
    info!(run_id = %id, "backtest run started");
    Ok(Json(CreatedResponse { id }))
}

async fn get_backtest(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BacktestReport>, ApiError> {
    state.backtests.get(id).map(Json).ok_or(ApiError::NotFound("backtest run"))
}

async fn cancel_backtest(
    _auth: AuthBearer,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    state.backtests.cancel(id);
    StatusCode::NO_CONTENT
}

// =============================================================================
// Error mapping
// =============================================================================

enum ApiError {
    NotFound(&'static str),
    BadRequest(&'static str),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            ApiError::Internal(err) => {
                warn!(error = %err, "internal API error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse { status: "ok", running_traders: 2, server_time: 0 };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["running_traders"], 2);
    }
}
