// Integration coverage for `FanOutEngine::execute` against `CloseAll` and
// for the upstream-id/symbol-fallback reconciliation in `record_trade`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use trading_orchestrator::error::StorageError;
use trading_orchestrator::event_bus::EventBus;
use trading_orchestrator::fanout::FanOutEngine;
use trading_orchestrator::models::{AccountSnapshot, Order, Session, Signal, Trade, User};
use trading_orchestrator::repository::Repository;
use trading_orchestrator::session_pool::SessionPool;
use trading_orchestrator::types::{OrderStatus, OrderType, Side, SignalAction};
use trading_orchestrator::upstream::{
    BalanceInfo, ClosePositionResult, LoginResult, OpenPosition, OpenPositionResult, RefreshResult,
    UpstreamClient, UpstreamError,
};
use trading_orchestrator::vault::CredentialVault;

struct FakeRepository {
    user: User,
    orders: Mutex<Vec<Order>>,
    trades: Mutex<Vec<Trade>>,
    signals: Mutex<Vec<Signal>>,
}

#[async_trait]
impl Repository for FakeRepository {
    async fn get_user(&self, uid: i64) -> Result<Option<User>, StorageError> {
        Ok(if uid == self.user.uid { Some(self.user.clone()) } else { None })
    }
    async fn list_active_users(&self) -> Result<Vec<User>, StorageError> {
        Ok(vec![self.user.clone()])
    }
    async fn get_active_session(&self, _uid: i64) -> Result<Option<Session>, StorageError> {
        Ok(None)
    }
    async fn list_active_sessions(&self) -> Result<Vec<Session>, StorageError> {
        Ok(Vec::new())
    }
    async fn upsert_active_session(&self, session: Session) -> Result<Session, StorageError> {
        Ok(session)
    }
    async fn deactivate_session(&self, _sid: i64) -> Result<(), StorageError> {
        Ok(())
    }
    async fn insert_signal(&self, signal: Signal) -> Result<Signal, StorageError> {
        self.signals.lock().push(signal.clone());
        Ok(signal)
    }
    async fn insert_order(&self, order: Order) -> Result<Order, StorageError> {
        self.orders.lock().push(order.clone());
        Ok(order)
    }
    async fn get_order_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .iter()
            .find(|o| o.upstream_id.as_deref() == Some(upstream_id))
            .cloned())
    }
    async fn most_recent_open_order(&self, uid: i64, symbol: &str) -> Result<Option<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .iter()
            .filter(|o| o.uid == uid && o.symbol == symbol && o.status == OrderStatus::Open)
            .max_by_key(|o| o.created_at)
            .cloned())
    }
    async fn list_open_orders(&self) -> Result<Vec<Order>, StorageError> {
        Ok(self.orders.lock().iter().filter(|o| o.status == OrderStatus::Open).cloned().collect())
    }
    async fn list_open_orders_for_user(&self, uid: i64) -> Result<Vec<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .iter()
            .filter(|o| o.uid == uid && o.status == OrderStatus::Open)
            .cloned()
            .collect())
    }
    async fn record_trade(
        &self,
        oid: i64,
        upstream_id: Option<String>,
        closed_at: DateTime<Utc>,
        trade: Trade,
    ) -> Result<(Order, Trade), StorageError> {
        let mut orders = self.orders.lock();
        let order = orders.iter_mut().find(|o| o.oid == oid).expect("order exists");
        order.status = OrderStatus::Closed;
        order.closed_at = Some(closed_at);
        if upstream_id.is_some() {
            order.upstream_id = upstream_id;
        }
        let order = order.clone();
        self.trades.lock().push(trade.clone());
        Ok((order, trade))
    }
    async fn list_trades(&self, uid: Option<i64>, symbol: Option<&str>) -> Result<Vec<Trade>, StorageError> {
        Ok(self
            .trades
            .lock()
            .iter()
            .filter(|t| uid.map_or(true, |u| u == t.uid))
            .filter(|t| symbol.map_or(true, |s| s == t.symbol))
            .cloned()
            .collect())
    }
    async fn upsert_account_balance(&self, uid: i64, balance: Decimal) -> Result<AccountSnapshot, StorageError> {
        Ok(AccountSnapshot { uid, balance, updated_at: Utc::now() })
    }
}

struct FakeUpstream {
    open_positions: Vec<OpenPosition>,
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
    async fn login(&self, _email: &str, _password: &str, _broker_id: &str) -> Result<LoginResult, UpstreamError> {
        Ok(LoginResult {
            auth_token: "auth".to_string(),
            trading_token: "trading".to_string(),
            trading_account_id: "acct".to_string(),
        })
    }
    async fn refresh_token(&self, auth_token: &str) -> Result<RefreshResult, UpstreamError> {
        Ok(RefreshResult { auth_token: auth_token.to_string(), trading_token: "trading".to_string() })
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
        unimplemented!("not exercised by close-all coverage")
    }
    async fn close_position(
        &self,
        _auth_token: &str,
        _trading_token: &str,
        upstream_id: &str,
    ) -> Result<ClosePositionResult, UpstreamError> {
        Ok(ClosePositionResult {
            close_price: dec!(110),
            profit: self
                .open_positions
                .iter()
                .find(|p| p.upstream_id == upstream_id)
                .map(|p| p.current_profit)
                .unwrap_or(Decimal::ZERO),
            commission: dec!(0.5),
        })
    }
    async fn list_open_positions(&self, _auth_token: &str, _trading_token: &str) -> Result<Vec<OpenPosition>, UpstreamError> {
        Ok(self.open_positions.clone())
    }
    async fn get_balance(&self, _auth_token: &str, _trading_token: &str) -> Result<BalanceInfo, UpstreamError> {
        Ok(BalanceInfo { balance: dec!(2000), equity: dec!(2000), margin: Decimal::ZERO, free_margin: dec!(2000) })
    }
}

fn test_key(seed: u8) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode([seed; 32])
}

fn open_order(oid: i64, uid: i64, symbol: &str, upstream_id: Option<&str>) -> Order {
    Order {
        oid,
        uid,
        upstream_id: upstream_id.map(str::to_string),
        symbol: symbol.to_string(),
        side: Side::Long,
        order_type: OrderType::Market,
        quantity: Decimal::ONE,
        entry_price: dec!(100),
        stop_loss: None,
        take_profit: None,
        status: OrderStatus::Open,
        created_at: Utc::now() - chrono::Duration::seconds(120),
        executed_at: Some(Utc::now() - chrono::Duration::seconds(120)),
        closed_at: None,
    }
}

fn open_position(symbol: &str, upstream_id: &str, profit: Decimal) -> OpenPosition {
    OpenPosition {
        upstream_id: upstream_id.to_string(),
        symbol: symbol.to_string(),
        side: Side::Long,
        volume: Decimal::ONE,
        entry_price: dec!(100),
        current_profit: profit,
    }
}

async fn engine(
    orders: Vec<Order>,
    open_positions: Vec<OpenPosition>,
) -> (Arc<FanOutEngine>, Arc<FakeRepository>) {
    let vault = Arc::new(CredentialVault::new(&test_key(7)).unwrap());
    let repo = Arc::new(FakeRepository {
        user: User {
            uid: 10,
            email: "trader@example.com".to_string(),
            encrypted_password: vault.encrypt("hunter2").unwrap().into_bytes(),
            broker_id: "broker-1".to_string(),
            active: true,
        },
        orders: Mutex::new(orders),
        trades: Mutex::new(Vec::new()),
        signals: Mutex::new(Vec::new()),
    });
    let upstream = Arc::new(FakeUpstream { open_positions });
    let sessions = Arc::new(SessionPool::new(repo.clone(), upstream.clone(), vault, 3));
    assert!(sessions.login_one(10).await.success);

    let bus = Arc::new(EventBus::new());
    let fanout = Arc::new(FanOutEngine::new(repo.clone(), upstream, sessions, bus));
    (fanout, repo)
}

#[tokio::test]
async fn close_all_reconciles_by_upstream_id_when_present() {
    let (fanout, repo) = engine(
        vec![open_order(1, 10, "EURUSD", Some("up-1"))],
        vec![open_position("EURUSD", "up-1", dec!(42.5))],
    )
    .await;

    let result = fanout.execute(SignalAction::CloseAll, None, Decimal::ZERO, None, None, None).await;

    assert!(result.success);
    assert_eq!(result.executed_count, 1);
    assert_eq!(result.failed_count, 0);
    assert_eq!(repo.trades.lock().len(), 1);
    assert_eq!(repo.orders.lock()[0].status, OrderStatus::Closed);
    assert_eq!(repo.trades.lock()[0].profit_loss, dec!(42.5));
}

#[tokio::test]
async fn close_all_falls_back_to_most_recent_open_order_by_symbol() {
    // The local order has no `upstream_id` on record (e.g. it was opened
    // before the broker handle was persisted), so reconciliation must fall
    // back to matching on (uid, symbol) against the most recent open order.
    let (fanout, repo) = engine(
        vec![open_order(2, 10, "GBPUSD", None)],
        vec![open_position("GBPUSD", "broker-handle-9", dec!(-10))],
    )
    .await;

    let result = fanout.execute(SignalAction::CloseAll, None, Decimal::ZERO, None, None, None).await;

    assert!(result.success);
    assert_eq!(result.executed_count, 1);
    assert_eq!(repo.trades.lock().len(), 1);
    assert_eq!(repo.orders.lock()[0].oid, 2);
    assert_eq!(repo.orders.lock()[0].upstream_id.as_deref(), Some("broker-handle-9"));
}

#[tokio::test]
async fn close_all_fails_the_position_when_no_local_order_matches_at_all() {
    let (fanout, _repo) = engine(Vec::new(), vec![open_position("EURUSD", "up-orphan", dec!(0))]).await;

    let result = fanout.execute(SignalAction::CloseAll, None, Decimal::ZERO, None, None, None).await;

    assert_eq!(result.executed_count, 0);
    assert_eq!(result.failed_count, 1);
    assert!(result.failed_orders[0].error.is_some());
}

#[tokio::test]
async fn execute_with_no_active_sessions_reports_success_with_zero_executions() {
    let vault = Arc::new(CredentialVault::new(&test_key(8)).unwrap());
    let repo = Arc::new(FakeRepository {
        user: User {
            uid: 99,
            email: "nobody@example.com".to_string(),
            encrypted_password: vault.encrypt("x").unwrap().into_bytes(),
            broker_id: "broker-1".to_string(),
            active: true,
        },
        orders: Mutex::new(Vec::new()),
        trades: Mutex::new(Vec::new()),
        signals: Mutex::new(Vec::new()),
    });
    let upstream = Arc::new(FakeUpstream { open_positions: Vec::new() });
    let sessions = Arc::new(SessionPool::new(repo.clone(), upstream.clone(), vault, 3));
    let bus = Arc::new(EventBus::new());
    let fanout = Arc::new(FanOutEngine::new(repo.clone(), upstream, sessions, bus));

    let result = fanout.execute(SignalAction::CloseAll, None, Decimal::ZERO, None, None, None).await;

    assert!(result.success);
    assert_eq!(result.executed_count, 0);
    assert_eq!(result.failed_count, 0);
    assert_eq!(repo.signals.lock().len(), 1);
}
