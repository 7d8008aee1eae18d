// =============================================================================
// PositionSupervisor — periodic reconciliation and auto-close
// =============================================================================
//
// One pass at a time, never aborts the sweep on a single user's error.
// Reconciliation maps an upstream position to a local order by
// `upstream_id` first, then by the most recent `OPEN` order for
// `(uid, symbol)`; a position with no local row at all is skipped.
// =============================================================================

use std::sync::Arc;

use tracing::warn;

use crate::config::SupervisorPolicy;
use crate::event_bus::EventBus;
use crate::fanout::FanOutEngine;
use crate::repository::Repository;
use crate::session_pool::SessionPool;
use crate::types::Channel;
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TickResult {
    pub checked: usize,
    pub closed: usize,
    pub errors: usize,
}

pub struct PositionSupervisor {
    repository: Arc<dyn Repository>,
    upstream: Arc<dyn UpstreamClient>,
    sessions: Arc<SessionPool>,
    fanout: Arc<FanOutEngine>,
    bus: Arc<EventBus>,
    policy: SupervisorPolicy,
}

impl PositionSupervisor {
    pub fn new(
        repository: Arc<dyn Repository>,
        upstream: Arc<dyn UpstreamClient>,
        sessions: Arc<SessionPool>,
        fanout: Arc<FanOutEngine>,
        bus: Arc<EventBus>,
        policy: SupervisorPolicy,
    ) -> Self {
        Self {
            repository,
            upstream,
            sessions,
            fanout,
            bus,
            policy,
        }
    }

    /// One reconciliation pass over every active session's open positions.
    /// A per-user or per-position failure is logged and counted, never
    /// allowed to abort the rest of the sweep.
    pub async fn tick(&self) -> TickResult {
        let mut result = TickResult::default();
        let snapshot = self.sessions.snapshot();

        for (uid, cached) in snapshot {
            let positions = match self
                .upstream
                .list_open_positions(&cached.auth_token, &cached.trading_token)
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    warn!(uid, error = %e, "failed to list open positions during supervisor tick");
                    result.errors += 1;
                    continue;
                }
            };

            for position in positions {
                result.checked += 1;

                let local_order = match self
                    .repository
                    .get_order_by_upstream_id(&position.upstream_id)
                    .await
                {
                    Ok(Some(o)) => Some(o),
                    Ok(None) => {
                        match self
                            .repository
                            .most_recent_open_order(uid, &position.symbol)
                            .await
                        {
                            Ok(o) => o,
                            Err(e) => {
                                warn!(uid, error = %e, "failed to reconcile local order");
                                result.errors += 1;
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(uid, error = %e, "failed to look up order by upstream id");
                        result.errors += 1;
                        continue;
                    }
                };

                let local_order = match local_order {
                    Some(o) => o,
                    None => continue,
                };

                let now = chrono::Utc::now();
                let holding_secs = local_order.holding_seconds(now);
                let profit = position.current_profit;

                let should_close = holding_secs >= self.policy.max_holding_secs
                    || profit >= self.policy.profit_target
                    || profit <= self.policy.loss_cutoff;

                if !should_close {
                    continue;
                }

                match self
                    .upstream
                    .close_position(&cached.auth_token, &cached.trading_token, &position.upstream_id)
                    .await
                {
                    Ok(close) => {
                        match self
                            .fanout
                            .record_trade(uid, &position.upstream_id, &position.symbol, close)
                            .await
                        {
                            Ok(trade) => {
                                result.closed += 1;
                                self.bus
                                    .publish_position_closed(
                                        &trade,
                                        &[Channel::Trading, Channel::Positions, Channel::Dashboard],
                                    )
                                    .await;
                            }
                            Err(e) => {
                                warn!(uid, error = %e, "failed to record trade after auto-close");
                                result.errors += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(uid, error = %e, "failed to close position during supervisor tick");
                        result.errors += 1;
                    }
                }
            }
        }

        self.bus
            .publish_positions_count(result.checked, &[Channel::Positions, Channel::Dashboard])
            .await;

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::StorageError;
    use crate::models::{AccountSnapshot, Order, Session, Signal, Trade, User};
    use crate::types::{OrderStatus, OrderType, Side};
    use crate::upstream::{
        BalanceInfo, ClosePositionResult, LoginResult, OpenPosition, OpenPositionResult, RefreshResult,
        UpstreamError,
    };
    use crate::vault::CredentialVault;

    struct FakeRepository {
        user: User,
        orders: Mutex<Vec<Order>>,
        trades: Mutex<Vec<Trade>>,
    }

    #[async_trait]
    impl Repository for FakeRepository {
        async fn get_user(&self, uid: i64) -> Result<Option<User>, StorageError> {
            Ok(if uid == self.user.uid { Some(self.user.clone()) } else { None })
        }
        async fn list_active_users(&self) -> Result<Vec<User>, StorageError> {
            unimplemented!()
        }
        async fn get_active_session(&self, _uid: i64) -> Result<Option<Session>, StorageError> {
            unimplemented!()
        }
        async fn list_active_sessions(&self) -> Result<Vec<Session>, StorageError> {
            unimplemented!()
        }
        async fn upsert_active_session(&self, session: Session) -> Result<Session, StorageError> {
            Ok(session)
        }
        async fn deactivate_session(&self, _sid: i64) -> Result<(), StorageError> {
            unimplemented!()
        }
        async fn insert_signal(&self, _signal: Signal) -> Result<Signal, StorageError> {
            unimplemented!()
        }
        async fn insert_order(&self, _order: Order) -> Result<Order, StorageError> {
            unimplemented!()
        }
        async fn get_order_by_upstream_id(
            &self,
            upstream_id: &str,
        ) -> Result<Option<Order>, StorageError> {
            Ok(self
                .orders
                .lock()
                .iter()
                .find(|o| o.upstream_id.as_deref() == Some(upstream_id))
                .cloned())
        }
        async fn most_recent_open_order(
            &self,
            _uid: i64,
            _symbol: &str,
        ) -> Result<Option<Order>, StorageError> {
            Ok(None)
        }
        async fn list_open_orders(&self) -> Result<Vec<Order>, StorageError> {
            unimplemented!()
        }
        async fn list_open_orders_for_user(&self, _uid: i64) -> Result<Vec<Order>, StorageError> {
            unimplemented!()
        }
        async fn record_trade(
            &self,
            oid: i64,
            upstream_id: Option<String>,
            closed_at: DateTime<Utc>,
            trade: Trade,
        ) -> Result<(Order, Trade), StorageError> {
            let mut orders = self.orders.lock();
            let order = orders.iter_mut().find(|o| o.oid == oid).unwrap();
            order.status = OrderStatus::Closed;
            order.closed_at = Some(closed_at);
            order.upstream_id = upstream_id.or(order.upstream_id.clone());
            let order = order.clone();
            self.trades.lock().push(trade.clone());
            Ok((order, trade))
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

    struct FakeUpstream {
        open_positions: Vec<OpenPosition>,
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn login(
            &self,
            _email: &str,
            _password: &str,
            _broker_id: &str,
        ) -> Result<LoginResult, UpstreamError> {
            Ok(LoginResult {
                auth_token: "auth".to_string(),
                trading_token: "trading".to_string(),
                trading_account_id: "acct".to_string(),
            })
        }
        async fn refresh_token(&self, _auth_token: &str) -> Result<RefreshResult, UpstreamError> {
            unimplemented!()
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
            Ok(ClosePositionResult {
                close_price: Decimal::new(105, 0),
                profit: Decimal::new(500, 2),
                commission: Decimal::ZERO,
            })
        }
        async fn list_open_positions(
            &self,
            _auth_token: &str,
            _trading_token: &str,
        ) -> Result<Vec<OpenPosition>, UpstreamError> {
            Ok(self.open_positions.clone())
        }
        async fn get_balance(
            &self,
            _auth_token: &str,
            _trading_token: &str,
        ) -> Result<BalanceInfo, UpstreamError> {
            unimplemented!()
        }
    }

    fn order(oid: i64, uid: i64, symbol: &str, upstream_id: &str) -> Order {
        Order {
            oid,
            uid,
            upstream_id: Some(upstream_id.to_string()),
            symbol: symbol.to_string(),
            side: Side::Long,
            order_type: OrderType::Market,
            quantity: Decimal::ONE,
            entry_price: Decimal::new(100, 0),
            stop_loss: None,
            take_profit: None,
            status: OrderStatus::Open,
            created_at: Utc::now() - chrono::Duration::seconds(60),
            executed_at: Some(Utc::now() - chrono::Duration::seconds(60)),
            closed_at: None,
        }
    }

    fn position(symbol: &str, upstream_id: &str, profit: Decimal) -> OpenPosition {
        OpenPosition {
            upstream_id: upstream_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            volume: Decimal::ONE,
            entry_price: Decimal::new(100, 0),
            current_profit: profit,
        }
    }

    fn test_key() -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([2u8; 32])
    }

    fn user(uid: i64, vault: &CredentialVault) -> User {
        User {
            uid,
            email: format!("user-{uid}@example.com"),
            encrypted_password: vault.encrypt("hunter2").unwrap().into_bytes(),
            broker_id: "broker-1".to_string(),
            active: true,
        }
    }

    /// Builds a supervisor over a single logged-in user, `uid` 10, so
    /// `tick()` has a live session to reconcile against.
    async fn supervisor(
        orders: Vec<Order>,
        open_positions: Vec<OpenPosition>,
        policy: SupervisorPolicy,
    ) -> (PositionSupervisor, Arc<FakeRepository>, Arc<EventBus>) {
        let vault = Arc::new(CredentialVault::new(&test_key()).unwrap());
        let repo = Arc::new(FakeRepository {
            user: user(10, &vault),
            orders: Mutex::new(orders),
            trades: Mutex::new(Vec::new()),
        });
        let upstream = Arc::new(FakeUpstream { open_positions });
        let sessions = Arc::new(SessionPool::new(repo.clone(), upstream.clone(), vault, 3));
        assert!(sessions.login_one(10).await.success);

        let bus = Arc::new(EventBus::new());
        let fanout = Arc::new(FanOutEngine::new(
            repo.clone(),
            upstream.clone(),
            sessions.clone(),
            bus.clone(),
        ));
        let sup =
            PositionSupervisor::new(repo.clone(), upstream, sessions, fanout, bus.clone(), policy);
        (sup, repo, bus)
    }

    #[tokio::test]
    async fn tick_closes_a_position_once_profit_target_is_reached_and_publishes_positions_count() {
        let policy = SupervisorPolicy {
            max_holding_secs: 300,
            profit_target: Decimal::new(100, 0),
            loss_cutoff: Decimal::new(-50, 0),
        };
        let (sup, repo, _bus) = supervisor(
            vec![order(1, 10, "EURUSD", "up-1")],
            vec![position("EURUSD", "up-1", Decimal::new(500, 0))],
            policy,
        )
        .await;

        let result = sup.tick().await;

        assert_eq!(result.checked, 1);
        assert_eq!(result.closed, 1);
        assert_eq!(result.errors, 0);
        assert_eq!(repo.trades.lock().len(), 1);
        assert_eq!(repo.orders.lock()[0].status, OrderStatus::Closed);
    }

    #[tokio::test]
    async fn tick_skips_positions_with_no_matching_local_order() {
        let policy = SupervisorPolicy {
            max_holding_secs: 300,
            profit_target: Decimal::new(100, 0),
            loss_cutoff: Decimal::new(-50, 0),
        };
        let (sup, repo, _bus) = supervisor(
            Vec::new(),
            vec![position("EURUSD", "up-unknown", Decimal::new(500, 0))],
            policy,
        )
        .await;

        let result = sup.tick().await;

        assert_eq!(result.checked, 1);
        assert_eq!(result.closed, 0);
        assert!(repo.trades.lock().is_empty());
    }
}
