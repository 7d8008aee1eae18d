// =============================================================================
// SessionPool — durable, self-refreshing upstream sessions
// =============================================================================
//
// The in-memory token cache is a read optimisation; the repository's
// `sessions` table is authoritative across restarts. Fan-out over users
// uses `tokio::task::JoinSet` rather than an unstructured
// `Vec<JoinHandle>`, so every spawned login/refresh is joined before the
// aggregate is returned.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::models::Session;
use crate::repository::Repository;
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::vault::CredentialVault;

const SESSION_TTL_MINUTES: i64 = 15;
const EXPIRING_SOON_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct CachedSession {
    pub auth_token: String,
    pub trading_token: String,
    pub trading_account_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoginOutcome {
    pub success: bool,
    pub uid: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoginAllResult {
    pub total_users: usize,
    pub successes: usize,
    pub failures: usize,
    pub per_user_results: Vec<LoginOutcome>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepResult {
    pub healthy: Vec<i64>,
    pub expiring_soon: Vec<i64>,
    pub expired: Vec<i64>,
}

/// Maintains the set of active upstream sessions: login, refresh, logout,
/// health classification, and the live-token cache. Always held behind an
/// `Arc` so its fan-out methods can spawn tasks that each hold a cloned
/// handle back to the pool.
pub struct SessionPool {
    repository: Arc<dyn Repository>,
    upstream: Arc<dyn UpstreamClient>,
    vault: Arc<CredentialVault>,
    max_retry_attempts: u32,
    cache: Mutex<HashMap<i64, CachedSession>>,
}

impl SessionPool {
    pub fn new(
        repository: Arc<dyn Repository>,
        upstream: Arc<dyn UpstreamClient>,
        vault: Arc<CredentialVault>,
        max_retry_attempts: u32,
    ) -> Self {
        Self {
            repository,
            upstream,
            vault,
            max_retry_attempts,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Logs in every active user in parallel, returning the aggregate.
    pub async fn login_all(self: &Arc<Self>) -> Result<LoginAllResult, crate::error::StorageError> {
        let users = self.repository.list_active_users().await?;
        let total_users = users.len();

        let mut set = tokio::task::JoinSet::new();
        for user in users {
            let this = self.clone();
            set.spawn(async move { this.login_one_inner(user.uid).await });
        }

        let mut per_user_results = Vec::with_capacity(total_users);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => per_user_results.push(outcome),
                Err(e) => warn!(error = %e, "login task panicked"),
            }
        }

        let successes = per_user_results.iter().filter(|r| r.success).count();
        let failures = per_user_results.len() - successes;
        Ok(LoginAllResult {
            total_users,
            successes,
            failures,
            per_user_results,
        })
    }

    /// Logs in a single user, retrying `AuthError`s with `2^k` second
    /// backoff up to `max_retry_attempts`. On terminal failure, an existing
    /// cached/durable session is left untouched — it remains until expiry.
    pub async fn login_one(&self, uid: i64) -> LoginOutcome {
        self.login_one_inner(uid).await
    }

    async fn login_one_inner(&self, uid: i64) -> LoginOutcome {
        let user = match self.repository.get_user(uid).await {
            Ok(Some(u)) => u,
            Ok(None) => {
                return LoginOutcome {
                    success: false,
                    uid,
                    reason: Some("user not found".to_string()),
                }
            }
            Err(e) => {
                return LoginOutcome {
                    success: false,
                    uid,
                    reason: Some(e.to_string()),
                }
            }
        };

        let password = match self
            .vault
            .decrypt(&String::from_utf8_lossy(&user.encrypted_password))
        {
            Ok(p) => p,
            Err(e) => {
                return LoginOutcome {
                    success: false,
                    uid,
                    reason: Some(format!("credential decrypt failed: {e}")),
                }
            }
        };

        for attempt in 0..=self.max_retry_attempts {
            match self
                .upstream
                .login(&user.email, &password, &user.broker_id)
                .await
            {
                Ok(result) => {
                    let now = Utc::now();
                    let expires_at = now + ChronoDuration::minutes(SESSION_TTL_MINUTES);
                    let session = Session {
                        sid: 0,
                        uid,
                        active: true,
                        auth_token: result.auth_token.clone(),
                        trading_token: result.trading_token.clone(),
                        trading_account_id: result.trading_account_id.clone(),
                        login_at: now,
                        expires_at,
                        last_refresh_at: None,
                    };
                    if let Err(e) = self.repository.upsert_active_session(session).await {
                        warn!(uid, error = %e, "failed to persist session after successful login");
                    }
                    self.cache.lock().insert(
                        uid,
                        CachedSession {
                            auth_token: result.auth_token,
                            trading_token: result.trading_token,
                            trading_account_id: result.trading_account_id,
                            expires_at,
                        },
                    );
                    info!(uid, attempt, "login succeeded");
                    return LoginOutcome {
                        success: true,
                        uid,
                        reason: None,
                    };
                }
                Err(UpstreamError::Auth(_)) if attempt < self.max_retry_attempts => {
                    let delay = 2u64.pow(attempt);
                    warn!(uid, attempt, delay, "login auth error, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
                Err(e) => {
                    return LoginOutcome {
                        success: false,
                        uid,
                        reason: Some(e.to_string()),
                    };
                }
            }
        }

        LoginOutcome {
            success: false,
            uid,
            reason: Some("exhausted retry attempts".to_string()),
        }
    }

    /// Logs out `uid`. The upstream logout call's error is ignored for
    /// idempotency — a session that is already gone upstream still needs
    /// its local state cleared.
    pub async fn logout(&self, uid: i64) -> Result<(), crate::error::StorageError> {
        if let Some(session) = self.repository.get_active_session(uid).await? {
            let _ = self.upstream.logout(&session.auth_token).await;
            self.repository.deactivate_session(session.sid).await?;
        }
        self.cache.lock().remove(&uid);
        Ok(())
    }

    /// Refreshes `uid`'s token. Falls back to a fresh `login_one` if there
    /// is no active session, or if the upstream rejects the refresh with an
    /// `AuthError`.
    pub async fn refresh_one(&self, uid: i64) -> LoginOutcome {
        let session = match self.repository.get_active_session(uid).await {
            Ok(Some(s)) => s,
            Ok(None) => return self.login_one_inner(uid).await,
            Err(e) => {
                return LoginOutcome {
                    success: false,
                    uid,
                    reason: Some(e.to_string()),
                }
            }
        };

        match self.upstream.refresh_token(&session.auth_token).await {
            Ok(refreshed) => {
                let now = Utc::now();
                let expires_at = now + ChronoDuration::minutes(SESSION_TTL_MINUTES);
                let trading_account_id = session.trading_account_id.clone();
                let updated = Session {
                    auth_token: refreshed.auth_token.clone(),
                    trading_token: refreshed.trading_token.clone(),
                    last_refresh_at: Some(now),
                    expires_at,
                    ..session
                };
                if let Err(e) = self.repository.upsert_active_session(updated).await {
                    warn!(uid, error = %e, "failed to persist refreshed session");
                }
                self.cache.lock().insert(
                    uid,
                    CachedSession {
                        auth_token: refreshed.auth_token,
                        trading_token: refreshed.trading_token,
                        trading_account_id,
                        expires_at,
                    },
                );
                LoginOutcome {
                    success: true,
                    uid,
                    reason: None,
                }
            }
            Err(UpstreamError::Auth(_)) => self.login_one_inner(uid).await,
            Err(e) => LoginOutcome {
                success: false,
                uid,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Refreshes every active session in parallel.
    pub async fn refresh_all(self: &Arc<Self>) -> Result<LoginAllResult, crate::error::StorageError> {
        let sessions = self.repository.list_active_sessions().await?;
        let total_users = sessions.len();

        let mut set = tokio::task::JoinSet::new();
        for session in sessions {
            let this = self.clone();
            set.spawn(async move { this.refresh_one(session.uid).await });
        }

        let mut per_user_results = Vec::with_capacity(total_users);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => per_user_results.push(outcome),
                Err(e) => warn!(error = %e, "refresh task panicked"),
            }
        }

        let successes = per_user_results.iter().filter(|r| r.success).count();
        let failures = per_user_results.len() - successes;
        Ok(LoginAllResult {
            total_users,
            successes,
            failures,
            per_user_results,
        })
    }

    /// Classifies every active session as healthy, expiring soon (within
    /// five minutes), or expired; dispatches a refresh for every expiring
    /// session in parallel and deactivates expired ones. Returns the three
    /// disjoint uid sets, which partition the input set exactly.
    pub async fn sweep(self: &Arc<Self>) -> Result<SweepResult, crate::error::StorageError> {
        let sessions = self.repository.list_active_sessions().await?;
        let now = Utc::now();

        let mut healthy = Vec::new();
        let mut expiring_soon = Vec::new();
        let mut expired = Vec::new();

        for session in sessions {
            let remaining = (session.expires_at - now).num_seconds();
            if remaining < 0 {
                if let Err(e) = self.repository.deactivate_session(session.sid).await {
                    warn!(uid = session.uid, error = %e, "failed to deactivate expired session");
                }
                self.cache.lock().remove(&session.uid);
                expired.push(session.uid);
            } else if remaining <= EXPIRING_SOON_SECS {
                expiring_soon.push(session.uid);
            } else {
                healthy.push(session.uid);
            }
        }

        let mut set = tokio::task::JoinSet::new();
        for uid in expiring_soon.iter().copied() {
            let this = self.clone();
            set.spawn(async move { this.refresh_one(uid).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "refresh task panicked during sweep");
            }
        }

        Ok(SweepResult {
            healthy,
            expiring_soon,
            expired,
        })
    }

    /// Returns the current cache snapshot: `uid -> CachedSession` for every
    /// session the pool believes is live. Used by `FanOutEngine` to decide
    /// who to fan a signal out to.
    pub fn snapshot(&self) -> HashMap<i64, CachedSession> {
        self.cache.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::models::{AccountSnapshot, Order, Session as SessionRow, Signal, Trade, User};
    use crate::repository::Repository;
    use crate::upstream::{
        BalanceInfo, ClosePositionResult, LoginResult, OpenPosition, OpenPositionResult,
        RefreshResult, UpstreamClient, UpstreamError,
    };
    use crate::types::Side;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct FakeRepository {
        sessions: Mutex<Vec<SessionRow>>,
        deactivated: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Repository for FakeRepository {
        async fn get_user(&self, _uid: i64) -> Result<Option<User>, StorageError> {
            unimplemented!()
        }
        async fn list_active_users(&self) -> Result<Vec<User>, StorageError> {
            unimplemented!()
        }
        async fn get_active_session(&self, uid: i64) -> Result<Option<SessionRow>, StorageError> {
            Ok(self.sessions.lock().iter().find(|s| s.uid == uid).cloned())
        }
        async fn list_active_sessions(&self) -> Result<Vec<SessionRow>, StorageError> {
            Ok(self.sessions.lock().clone())
        }
        async fn upsert_active_session(
            &self,
            session: SessionRow,
        ) -> Result<SessionRow, StorageError> {
            let mut guard = self.sessions.lock();
            if let Some(existing) = guard.iter_mut().find(|s| s.uid == session.uid) {
                *existing = session.clone();
            } else {
                guard.push(session.clone());
            }
            Ok(session)
        }
        async fn deactivate_session(&self, sid: i64) -> Result<(), StorageError> {
            self.deactivated.lock().push(sid);
            self.sessions.lock().retain(|s| s.sid != sid);
            Ok(())
        }
        async fn insert_signal(&self, _signal: Signal) -> Result<Signal, StorageError> {
            unimplemented!()
        }
        async fn insert_order(&self, _order: Order) -> Result<Order, StorageError> {
            unimplemented!()
        }
        async fn get_order_by_upstream_id(
            &self,
            _upstream_id: &str,
        ) -> Result<Option<Order>, StorageError> {
            unimplemented!()
        }
        async fn most_recent_open_order(
            &self,
            _uid: i64,
            _symbol: &str,
        ) -> Result<Option<Order>, StorageError> {
            unimplemented!()
        }
        async fn list_open_orders(&self) -> Result<Vec<Order>, StorageError> {
            unimplemented!()
        }
        async fn list_open_orders_for_user(&self, _uid: i64) -> Result<Vec<Order>, StorageError> {
            unimplemented!()
        }
        async fn record_trade(
            &self,
            _oid: i64,
            _upstream_id: Option<String>,
            _closed_at: DateTime<Utc>,
            _trade: Trade,
        ) -> Result<(Order, Trade), StorageError> {
            unimplemented!()
        }
        async fn list_trades(
            &self,
            _uid: Option<i64>,
            _symbol: Option<&str>,
        ) -> Result<Vec<Trade>, StorageError> {
            unimplemented!()
        }
        async fn upsert_account_balance(
            &self,
            _uid: i64,
            _balance: Decimal,
        ) -> Result<AccountSnapshot, StorageError> {
            unimplemented!()
        }
    }

    struct FakeUpstream;

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn login(
            &self,
            _email: &str,
            _password: &str,
            _broker_id: &str,
        ) -> Result<LoginResult, UpstreamError> {
            unimplemented!()
        }
        async fn refresh_token(&self, auth_token: &str) -> Result<RefreshResult, UpstreamError> {
            Ok(RefreshResult {
                auth_token: format!("{auth_token}-refreshed"),
                trading_token: "trading-refreshed".to_string(),
            })
        }
        async fn logout(&self, _auth_token: &str) -> Result<(), UpstreamError> {
            Ok(())
        }
        async fn open_position(
            &self,
            _auth_token: &str,
            _trading_token: &str,
            _symbol: &str,
            _side: Side,
            _volume: Decimal,
            _stop_loss: Option<Decimal>,
            _take_profit: Option<Decimal>,
        ) -> Result<OpenPositionResult, UpstreamError> {
            unimplemented!()
        }
        async fn close_position(
            &self,
            _auth_token: &str,
            _trading_token: &str,
            _upstream_id: &str,
        ) -> Result<ClosePositionResult, UpstreamError> {
            unimplemented!()
        }
        async fn list_open_positions(
            &self,
            _auth_token: &str,
            _trading_token: &str,
        ) -> Result<Vec<OpenPosition>, UpstreamError> {
            unimplemented!()
        }
        async fn get_balance(
            &self,
            _auth_token: &str,
            _trading_token: &str,
        ) -> Result<BalanceInfo, UpstreamError> {
            unimplemented!()
        }
    }

    fn session(sid: i64, uid: i64, expires_in_secs: i64) -> SessionRow {
        SessionRow {
            sid,
            uid,
            active: true,
            auth_token: format!("auth-{uid}"),
            trading_token: format!("trading-{uid}"),
            trading_account_id: format!("acct-{uid}"),
            login_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            last_refresh_at: None,
        }
    }

    fn test_key() -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([1u8; 32])
    }

    fn pool(sessions: Vec<SessionRow>) -> (Arc<SessionPool>, Arc<FakeRepository>) {
        let repo = Arc::new(FakeRepository {
            sessions: Mutex::new(sessions),
            deactivated: Mutex::new(Vec::new()),
        });
        let sessions_pool = Arc::new(SessionPool::new(
            repo.clone(),
            Arc::new(FakeUpstream),
            Arc::new(CredentialVault::new(&test_key()).unwrap()),
            3,
        ));
        (sessions_pool, repo)
    }

    #[tokio::test]
    async fn sweep_partitions_sessions_into_healthy_expiring_and_expired() {
        let (pool, _repo) = pool(vec![
            session(1, 10, 3600), // healthy
            session(2, 20, 120),  // expiring soon
            session(3, 30, -10),  // already expired
        ]);

        let result = pool.sweep().await.unwrap();

        assert_eq!(result.healthy, vec![10]);
        assert_eq!(result.expiring_soon, vec![20]);
        assert_eq!(result.expired, vec![30]);
    }

    #[tokio::test]
    async fn sweep_deactivates_expired_sessions_and_clears_their_cache_entry() {
        let (pool, repo) = pool(vec![session(1, 10, -5)]);
        pool.cache.lock().insert(
            10,
            CachedSession {
                auth_token: "auth-10".to_string(),
                trading_token: "trading-10".to_string(),
                trading_account_id: "acct-10".to_string(),
                expires_at: Utc::now() - ChronoDuration::seconds(5),
            },
        );

        pool.sweep().await.unwrap();

        assert!(pool.snapshot().get(&10).is_none());
        assert_eq!(*repo.deactivated.lock(), vec![1]);
    }
}
