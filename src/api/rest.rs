// =============================================================================
// REST API Endpoints — control surface
// =============================================================================
//
// CORS via `tower_http`, origins driven by `AppConfig::cors_origins`
// (wildcard if it contains `*`), `AuthBearer` on every endpoint except
// `/health`, errors mapped through `OrchestratorError`'s `IntoResponse`.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::HeaderValue,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::error::OrchestratorError;
use crate::repository::Repository;
use crate::types::SignalAction;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(cors_origin(&state.config.cors_origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/users/:uid/login", post(user_login))
        .route("/users/:uid/logout", post(user_logout))
        .route("/users/login-all", post(login_all))
        .route("/sessions/refresh-all", post(refresh_all))
        .route("/sessions/health/check", get(sweep))
        .route("/trading/signal", post(trading_signal))
        .route("/trading/close-all", post(trading_close_all))
        .route("/trading/positions", get(trading_positions))
        .route("/trading/trades", get(trading_trades))
        .route("/bus/statistics", get(bus_statistics))
        .route("/ws/:channel", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Wildcard if `CORS_ORIGINS` contains `*` (the default), otherwise the
/// exact parsed origin list. An origin string that fails to parse as a
/// header value is dropped rather than failing router construction.
fn cors_origin(origins: &[String]) -> tower_http::cors::AllowOrigin {
    if origins.iter().any(|o| o == "*") {
        return tower_http::cors::AllowOrigin::any();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    tower_http::cors::AllowOrigin::list(parsed)
}

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

async fn user_login(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(uid): Path<i64>,
) -> impl IntoResponse {
    Json(state.sessions.login_one(uid).await)
}

async fn user_logout(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(uid): Path<i64>,
) -> Result<impl IntoResponse, OrchestratorError> {
    state
        .sessions
        .logout(uid)
        .await
        .map_err(OrchestratorError::from)?;
    Ok(Json(serde_json::json!({ "uid": uid, "success": true })))
}

async fn login_all(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let result = state.sessions.login_all().await?;
    Ok(Json(result))
}

async fn refresh_all(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let result = state.sessions.refresh_all().await?;
    Ok(Json(result))
}

async fn sweep(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let result = state.sessions.sweep().await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct SignalBody {
    action: SignalAction,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    entry_price: Option<Decimal>,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
    #[serde(default = "default_volume")]
    volume: Decimal,
    #[serde(default)]
    reason: Option<String>,
}

fn default_volume() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.1)
}

async fn trading_signal(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignalBody>,
) -> impl IntoResponse {
    let result = state
        .fanout
        .execute(
            body.action,
            body.symbol,
            body.volume,
            body.stop_loss,
            body.take_profit,
            body.reason,
        )
        .await;
    Json(result)
}

#[derive(Debug, Deserialize)]
struct CloseAllBody {
    #[serde(default)]
    symbol: Option<String>,
}

async fn trading_close_all(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseAllBody>,
) -> impl IntoResponse {
    let result = state
        .fanout
        .execute(
            SignalAction::CloseAll,
            body.symbol,
            Decimal::ZERO,
            None,
            None,
            None,
        )
        .await;
    Json(result)
}

async fn trading_positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let positions = state.repository.list_open_orders().await?;
    Ok(Json(positions))
}

#[derive(Debug, Deserialize)]
struct TradeFilters {
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    symbol: Option<String>,
}

async fn trading_trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(filters): Query<TradeFilters>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let trades = state
        .repository
        .list_trades(filters.user_id, filters.symbol.as_deref())
        .await?;
    Ok(Json(trades))
}

async fn bus_statistics(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bus.statistics().await)
}
