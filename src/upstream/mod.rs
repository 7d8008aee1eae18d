// =============================================================================
// UpstreamClient — the adapter boundary to the brokerage API
// =============================================================================

mod http;

pub use http::HttpUpstreamClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, RequestError, TransientError};
use crate::types::Side;

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub auth_token: String,
    pub trading_token: String,
    pub trading_account_id: String,
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub auth_token: String,
    pub trading_token: String,
}

#[derive(Debug, Clone)]
pub struct OpenPositionResult {
    pub upstream_id: String,
    pub filled_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct ClosePositionResult {
    pub close_price: Decimal,
    pub profit: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub upstream_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub current_profit: Decimal,
}

#[derive(Debug, Clone)]
pub struct BalanceInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
}

/// An error that can come back from any upstream call. Callers match on the
/// variant rather than inspecting a status code — `Auth` never retries,
/// `Request` never retries, `Transient` has already exhausted its retry
/// budget by the time it surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Transient(#[from] TransientError),
}

/// The narrow interface the core consumes. Every method retries transient
/// network failures internally (see `http.rs`) and surfaces a typed error
/// once its budget is exhausted.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn login(
        &self,
        email: &str,
        password: &str,
        broker_id: &str,
    ) -> Result<LoginResult, UpstreamError>;

    async fn refresh_token(&self, auth_token: &str) -> Result<RefreshResult, UpstreamError>;

    async fn logout(&self, auth_token: &str) -> Result<(), UpstreamError>;

    #[allow(clippy::too_many_arguments)]
    async fn open_position(
        &self,
        auth_token: &str,
        trading_token: &str,
        symbol: &str,
        side: Side,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<OpenPositionResult, UpstreamError>;

    async fn close_position(
        &self,
        auth_token: &str,
        trading_token: &str,
        upstream_id: &str,
    ) -> Result<ClosePositionResult, UpstreamError>;

    async fn list_open_positions(
        &self,
        auth_token: &str,
        trading_token: &str,
    ) -> Result<Vec<OpenPosition>, UpstreamError>;

    async fn get_balance(
        &self,
        auth_token: &str,
        trading_token: &str,
    ) -> Result<BalanceInfo, UpstreamError>;
}
