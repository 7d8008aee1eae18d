// =============================================================================
// FanOutEngine — concurrent per-account signal execution
// =============================================================================
//
// Per-user fan-out uses `tokio::task::JoinSet` (a scope that launches N
// child tasks and joins all of them before returning) rather than
// unstructured `tokio::spawn` + `Vec<JoinHandle>`.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::warn;

use crate::event_bus::EventBus;
use crate::models::{Order, Signal, Trade};
use crate::repository::Repository;
use crate::session_pool::SessionPool;
use crate::types::{Channel, OrderStatus, OrderType, SignalAction};
use crate::upstream::UpstreamClient;

/// A single user's balance in, sized volume out. Thresholds and caps are
/// the orchestrator's own risk policy, independent of what any one
/// brokerage account happens to allow.
pub fn size_position(requested: Decimal, balance: Decimal) -> Decimal {
    if balance < dec!(1000) {
        requested.min(dec!(0.01))
    } else if balance < dec!(5000) {
        requested.min(dec!(0.05))
    } else {
        requested
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutedOrder {
    pub success: bool,
    pub uid: i64,
    pub oid: Option<i64>,
    pub upstream_id: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub volume: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanOutResult {
    pub success: bool,
    pub executed_count: usize,
    pub failed_count: usize,
    pub total_volume: Decimal,
    pub execution_time_ms: u64,
    pub successful_orders: Vec<ExecutedOrder>,
    pub failed_orders: Vec<ExecutedOrder>,
}

pub struct FanOutEngine {
    repository: Arc<dyn Repository>,
    upstream: Arc<dyn UpstreamClient>,
    sessions: Arc<SessionPool>,
    bus: Arc<EventBus>,
}

impl FanOutEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        upstream: Arc<dyn UpstreamClient>,
        sessions: Arc<SessionPool>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            repository,
            upstream,
            sessions,
            bus,
        }
    }

    /// Executes `signal` against every active session. The signal row is
    /// persisted first, best-effort — a failure to log it must not block
    /// execution. `success=true` means the fan-out itself ran, independent
    /// of whether every per-user action succeeded.
    pub async fn execute(
        self: &Arc<Self>,
        action: SignalAction,
        symbol: Option<String>,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        reason: Option<String>,
    ) -> FanOutResult {
        let started = Instant::now();

        let signal = Signal {
            sgid: 0,
            action,
            symbol: symbol.clone(),
            entry_price: None,
            stop_loss,
            take_profit,
            strength: None,
            reason: reason.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.repository.insert_signal(signal).await {
            warn!(error = %e, "failed to persist signal, executing anyway");
        }

        let snapshot = self.sessions.snapshot();
        if snapshot.is_empty() {
            return FanOutResult {
                success: true,
                executed_count: 0,
                failed_count: 0,
                total_volume: Decimal::ZERO,
                execution_time_ms: started.elapsed().as_millis() as u64,
                successful_orders: vec![],
                failed_orders: vec![],
            };
        }

        let mut set = tokio::task::JoinSet::new();
        for (uid, cached) in snapshot {
            let this = self.clone();
            let symbol = symbol.clone();
            set.spawn(async move {
                if action.is_open() {
                    this.execute_open_for_user(
                        uid,
                        cached,
                        action,
                        symbol.unwrap_or_default(),
                        volume,
                        stop_loss,
                        take_profit,
                    )
                    .await
                } else {
                    this.execute_close_for_user(uid, cached, symbol).await
                }
            });
        }

        let mut successful_orders = Vec::new();
        let mut failed_orders = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => {
                    for r in results {
                        if r.success {
                            successful_orders.push(r);
                        } else {
                            failed_orders.push(r);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "fan-out task panicked"),
            }
        }

        let total_volume = successful_orders
            .iter()
            .filter_map(|o| o.volume)
            .sum::<Decimal>();

        FanOutResult {
            success: true,
            executed_count: successful_orders.len(),
            failed_count: failed_orders.len(),
            total_volume,
            execution_time_ms: started.elapsed().as_millis() as u64,
            successful_orders,
            failed_orders,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_open_for_user(
        &self,
        uid: i64,
        cached: crate::session_pool::CachedSession,
        action: SignalAction,
        symbol: String,
        requested_volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Vec<ExecutedOrder> {
        let side = match action.side() {
            Some(s) => s,
            None => return vec![],
        };

        let balance = match self
            .upstream
            .get_balance(&cached.auth_token, &cached.trading_token)
            .await
        {
            Ok(b) => b.balance,
            Err(e) => {
                return vec![ExecutedOrder {
                    success: false,
                    uid,
                    oid: None,
                    upstream_id: None,
                    symbol: Some(symbol),
                    side: None,
                    volume: None,
                    entry_price: None,
                    error: Some(e.to_string()),
                }]
            }
        };

        if let Err(e) = self.repository.upsert_account_balance(uid, balance).await {
            warn!(uid, error = %e, "failed to refresh account balance cache");
        }

        let volume = size_position(requested_volume, balance);

        let opened = self
            .upstream
            .open_position(
                &cached.auth_token,
                &cached.trading_token,
                &symbol,
                side,
                volume,
                stop_loss,
                take_profit,
            )
            .await;

        match opened {
            Ok(result) => {
                let now = Utc::now();
                let order = Order {
                    oid: 0,
                    uid,
                    upstream_id: Some(result.upstream_id.clone()),
                    symbol: symbol.clone(),
                    side,
                    order_type: OrderType::Market,
                    quantity: volume,
                    entry_price: result.filled_price,
                    stop_loss,
                    take_profit,
                    status: OrderStatus::Open,
                    created_at: now,
                    executed_at: Some(now),
                    closed_at: None,
                };
                let inserted = match self.repository.insert_order(order).await {
                    Ok(o) => o,
                    Err(e) => {
                        warn!(uid, error = %e, "failed to persist opened order");
                        return vec![ExecutedOrder {
                            success: false,
                            uid,
                            oid: None,
                            upstream_id: Some(result.upstream_id),
                            symbol: Some(symbol),
                            side: Some(side.to_string()),
                            volume: Some(volume),
                            entry_price: Some(result.filled_price),
                            error: Some(e.to_string()),
                        }];
                    }
                };

                self.bus
                    .publish_order_executed(&inserted, &[Channel::Trading, Channel::Positions, Channel::Dashboard])
                    .await;

                vec![ExecutedOrder {
                    success: true,
                    uid,
                    oid: Some(inserted.oid),
                    upstream_id: inserted.upstream_id,
                    symbol: Some(inserted.symbol),
                    side: Some(side.to_string()),
                    volume: Some(volume),
                    entry_price: Some(inserted.entry_price),
                    error: None,
                }]
            }
            Err(e) => vec![ExecutedOrder {
                success: false,
                uid,
                oid: None,
                upstream_id: None,
                symbol: Some(symbol),
                side: Some(side.to_string()),
                volume: Some(volume),
                entry_price: None,
                error: Some(e.to_string()),
            }],
        }
    }

    async fn execute_close_for_user(
        &self,
        uid: i64,
        cached: crate::session_pool::CachedSession,
        symbol_filter: Option<String>,
    ) -> Vec<ExecutedOrder> {
        let positions = match self
            .upstream
            .list_open_positions(&cached.auth_token, &cached.trading_token)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                return vec![ExecutedOrder {
                    success: false,
                    uid,
                    oid: None,
                    upstream_id: None,
                    symbol: symbol_filter,
                    side: None,
                    volume: None,
                    entry_price: None,
                    error: Some(e.to_string()),
                }]
            }
        };

        let targets: Vec<_> = positions
            .into_iter()
            .filter(|p| match symbol_filter.as_deref() {
                Some(s) => s == p.symbol,
                None => true,
            })
            .collect();

        let mut results = Vec::with_capacity(targets.len());
        for position in targets {
            match self
                .upstream
                .close_position(&cached.auth_token, &cached.trading_token, &position.upstream_id)
                .await
            {
                Ok(close) => match self
                    .record_trade(uid, &position.upstream_id, &position.symbol, close)
                    .await
                {
                    Ok(trade) => {
                        self.bus
                            .publish_position_closed(&trade, &[Channel::Trading, Channel::Positions, Channel::Dashboard])
                            .await;
                        results.push(ExecutedOrder {
                            success: true,
                            uid,
                            oid: Some(trade.oid),
                            upstream_id: Some(position.upstream_id),
                            symbol: Some(position.symbol),
                            side: Some(position.side.to_string()),
                            volume: Some(position.volume),
                            entry_price: Some(position.entry_price),
                            error: None,
                        });
                    }
                    Err(e) => results.push(ExecutedOrder {
                        success: false,
                        uid,
                        oid: None,
                        upstream_id: Some(position.upstream_id),
                        symbol: Some(position.symbol),
                        side: Some(position.side.to_string()),
                        volume: Some(position.volume),
                        entry_price: Some(position.entry_price),
                        error: Some(e.to_string()),
                    }),
                },
                Err(e) => results.push(ExecutedOrder {
                    success: false,
                    uid,
                    oid: None,
                    upstream_id: Some(position.upstream_id),
                    symbol: Some(position.symbol),
                    side: Some(position.side.to_string()),
                    volume: Some(position.volume),
                    entry_price: Some(position.entry_price),
                    error: Some(e.to_string()),
                }),
            }
        }
        results
    }

    /// Reconciles an upstream close with a local order: first by
    /// `upstream_id`, then by the most recent `OPEN` order for
    /// `(uid, symbol)` if the upstream handle has no local row. Inserts the
    /// immutable `Trade` record.
    pub async fn record_trade(
        &self,
        uid: i64,
        upstream_id: &str,
        symbol: &str,
        close: crate::upstream::ClosePositionResult,
    ) -> Result<Trade, crate::error::StorageError> {
        let order = match self.repository.get_order_by_upstream_id(upstream_id).await? {
            Some(o) => o,
            None => match self.repository.most_recent_open_order(uid, symbol).await? {
                Some(o) => o,
                None => {
                    return Err(crate::error::StorageError(format!(
                        "no local order found for upstream_id={upstream_id} uid={uid} symbol={symbol}"
                    )))
                }
            },
        };

        let now = Utc::now();
        let entry_price = order.entry_price;
        let profit_loss = close.profit;
        let profit_loss_percent = if entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (profit_loss / (entry_price * order.quantity)) * dec!(100)
        };
        let executed_at = order.executed_at.unwrap_or(order.created_at);
        let duration_seconds = (now - executed_at).num_seconds().max(0);

        let trade = Trade {
            tid: 0,
            oid: order.oid,
            uid,
            symbol: order.symbol.clone(),
            side: order.side,
            entry_price,
            exit_price: close.close_price,
            quantity: order.quantity,
            profit_loss,
            profit_loss_percent,
            commission: close.commission,
            duration_seconds,
            executed_at,
            closed_at: now,
        };

        let (_, trade) = self
            .repository
            .record_trade(order.oid, Some(upstream_id.to_string()), now, trade)
            .await?;
        Ok(trade)
    }
}
