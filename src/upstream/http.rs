// =============================================================================
// HttpUpstreamClient — reqwest-based UpstreamClient implementation
// =============================================================================
//
// Client construction and per-method tracing follow the same shape as the
// crate's other exchange clients, with HMAC query-signing dropped (this
// upstream authenticates via bearer + trading-token headers, not a signed
// query string) and a retry wrapper added per the upstream adapter's retry
// policy: up to 3 retries on transient failure, `2^k` second backoff, no
// retry on 401 (`AuthError`) or other 4xx (`RequestError`).
// =============================================================================

use std::time::Duration;

use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{instrument, warn};

use crate::error::{AuthError, RequestError, TransientError};
use crate::types::Side;

use super::{
    BalanceInfo, ClosePositionResult, LoginResult, OpenPosition, OpenPositionResult,
    RefreshResult, UpstreamClient, UpstreamError,
};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for the upstream brokerage API.
pub struct HttpUpstreamClient {
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpUpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstreamClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpUpstreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Runs `attempt` up to `MAX_RETRIES + 1` times, sleeping `2^k` seconds
    /// between attempts. `attempt` itself is responsible for distinguishing
    /// a retryable `TransientError` from a terminal `Auth`/`Request` error —
    /// only `TransientError` triggers a retry here.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut attempt: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let mut last_err = None;
        for k in 0..=MAX_RETRIES {
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(UpstreamError::Transient(e)) => {
                    warn!(op, attempt = k, error = %e, "transient upstream error, retrying");
                    last_err = Some(UpstreamError::Transient(e));
                    if k < MAX_RETRIES {
                        tokio::time::sleep(Duration::from_secs(2u64.pow(k))).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }

    /// Classifies a response status into the upstream error taxonomy, or
    /// returns `Ok(())` for success. 401 is always `AuthError`; other 4xx is
    /// `RequestError`; 5xx and connection-level failures are `Transient`.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AuthError::TokenRejected(body).into());
        }
        if status.is_client_error() {
            return Err(RequestError {
                status: status.as_u16(),
                message: body,
            }
            .into());
        }
        Err(TransientError(format!("upstream returned {status}: {body}")).into())
    }

    fn map_transport_err(op: &str, e: reqwest::Error) -> UpstreamError {
        TransientError(format!("{op} request failed: {e}")).into()
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth_token: String,
    trading_token: String,
    trading_account_id: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    auth_token: String,
    trading_token: String,
}

#[derive(Deserialize)]
struct OpenPositionResponse {
    upstream_id: String,
    filled_price: Decimal,
}

#[derive(Deserialize)]
struct ClosePositionResponse {
    close_price: Decimal,
    profit: Decimal,
    commission: Decimal,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: Decimal,
    equity: Decimal,
    margin: Decimal,
    free_margin: Decimal,
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstreamClient {
    #[instrument(skip(self, password), name = "upstream::login")]
    async fn login(
        &self,
        email: &str,
        password: &str,
        broker_id: &str,
    ) -> Result<LoginResult, UpstreamError> {
        self.with_retry("login", || async {
            let resp = self
                .client
                .post(format!("{}/manager/mtr-login", self.base_url))
                .json(&json!({ "email": email, "password": password, "broker_id": broker_id }))
                .send()
                .await
                .map_err(|e| Self::map_transport_err("login", e))?;
            let resp = Self::check_status(resp).await?;
            let body: LoginResponse = resp
                .json()
                .await
                .map_err(|e| Self::map_transport_err("login", e))?;
            Ok(LoginResult {
                auth_token: body.auth_token,
                trading_token: body.trading_token,
                trading_account_id: body.trading_account_id,
            })
        })
        .await
    }

    #[instrument(skip(self, auth_token), name = "upstream::refresh_token")]
    async fn refresh_token(&self, auth_token: &str) -> Result<RefreshResult, UpstreamError> {
        self.with_retry("refresh_token", || async {
            let resp = self
                .client
                .post(format!("{}/manager/refresh-token", self.base_url))
                .bearer_auth(auth_token)
                .send()
                .await
                .map_err(|e| Self::map_transport_err("refresh_token", e))?;
            let resp = Self::check_status(resp).await?;
            let body: RefreshResponse = resp
                .json()
                .await
                .map_err(|e| Self::map_transport_err("refresh_token", e))?;
            Ok(RefreshResult {
                auth_token: body.auth_token,
                trading_token: body.trading_token,
            })
        })
        .await
    }

    #[instrument(skip(self, auth_token), name = "upstream::logout")]
    async fn logout(&self, auth_token: &str) -> Result<(), UpstreamError> {
        self.with_retry("logout", || async {
            let resp = self
                .client
                .post(format!("{}/manager/logout", self.base_url))
                .bearer_auth(auth_token)
                .send()
                .await
                .map_err(|e| Self::map_transport_err("logout", e))?;
            Self::check_status(resp).await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, auth_token, trading_token), name = "upstream::open_position")]
    async fn open_position(
        &self,
        auth_token: &str,
        trading_token: &str,
        symbol: &str,
        side: Side,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<OpenPositionResult, UpstreamError> {
        self.with_retry("open_position", || async {
            let resp = self
                .client
                .post(format!("{}/trading/positions/open", self.base_url))
                .bearer_auth(auth_token)
                .header("Trading-Api-Token", trading_token)
                .json(&json!({
                    "symbol": symbol,
                    "side": side.upstream_side(),
                    "volume": volume,
                    "stop_loss": stop_loss,
                    "take_profit": take_profit,
                }))
                .send()
                .await
                .map_err(|e| Self::map_transport_err("open_position", e))?;
            let resp = Self::check_status(resp).await?;
            let body: OpenPositionResponse = resp
                .json()
                .await
                .map_err(|e| Self::map_transport_err("open_position", e))?;
            Ok(OpenPositionResult {
                upstream_id: body.upstream_id,
                filled_price: body.filled_price,
            })
        })
        .await
    }

    #[instrument(skip(self, auth_token, trading_token), name = "upstream::close_position")]
    async fn close_position(
        &self,
        auth_token: &str,
        trading_token: &str,
        upstream_id: &str,
    ) -> Result<ClosePositionResult, UpstreamError> {
        self.with_retry("close_position", || async {
            let resp = self
                .client
                .post(format!("{}/trading/positions/{}/close", self.base_url, upstream_id))
                .bearer_auth(auth_token)
                .header("Trading-Api-Token", trading_token)
                .send()
                .await
                .map_err(|e| Self::map_transport_err("close_position", e))?;
            let resp = Self::check_status(resp).await?;
            let body: ClosePositionResponse = resp
                .json()
                .await
                .map_err(|e| Self::map_transport_err("close_position", e))?;
            Ok(ClosePositionResult {
                close_price: body.close_price,
                profit: body.profit,
                commission: body.commission,
            })
        })
        .await
    }

    #[instrument(skip(self, auth_token, trading_token), name = "upstream::list_open_positions")]
    async fn list_open_positions(
        &self,
        auth_token: &str,
        trading_token: &str,
    ) -> Result<Vec<OpenPosition>, UpstreamError> {
        self.with_retry("list_open_positions", || async {
            let resp = self
                .client
                .get(format!("{}/trading/positions/opened", self.base_url))
                .bearer_auth(auth_token)
                .header("Trading-Api-Token", trading_token)
                .send()
                .await
                .map_err(|e| Self::map_transport_err("list_open_positions", e))?;
            let resp = Self::check_status(resp).await?;
            let body: Vec<OpenPosition> = resp
                .json()
                .await
                .map_err(|e| Self::map_transport_err("list_open_positions", e))?;
            Ok(body)
        })
        .await
    }

    #[instrument(skip(self, auth_token, trading_token), name = "upstream::get_balance")]
    async fn get_balance(
        &self,
        auth_token: &str,
        trading_token: &str,
    ) -> Result<BalanceInfo, UpstreamError> {
        self.with_retry("get_balance", || async {
            let resp = self
                .client
                .get(format!("{}/trading/balance", self.base_url))
                .bearer_auth(auth_token)
                .header("Trading-Api-Token", trading_token)
                .send()
                .await
                .map_err(|e| Self::map_transport_err("get_balance", e))?;
            let resp = Self::check_status(resp).await?;
            let body: BalanceResponse = resp
                .json()
                .await
                .map_err(|e| Self::map_transport_err("get_balance", e))?;
            Ok(BalanceInfo {
                balance: body.balance,
                equity: body.equity,
                margin: body.margin,
                free_margin: body.free_margin,
            })
        })
        .await
    }
}
