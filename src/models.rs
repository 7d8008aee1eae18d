// =============================================================================
// Persisted row types — User, Session, Order, Trade, Signal
// =============================================================================
//
// See `repository.rs` for the DDL these map onto. Money fields use
// `rust_decimal::Decimal`, never `f64` — P&L accounting must not
// accumulate binary-float rounding error across a long-running position's
// lifetime.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, Side, SignalAction};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub uid: i64,
    pub email: String,
    pub encrypted_password: Vec<u8>,
    pub broker_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub sid: i64,
    pub uid: i64,
    pub active: bool,
    pub auth_token: String,
    pub trading_token: String,
    pub trading_account_id: String,
    pub login_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub oid: i64,
    pub uid: i64,
    pub upstream_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trade {
    pub tid: i64,
    pub oid: i64,
    pub uid: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub profit_loss: Decimal,
    pub profit_loss_percent: Decimal,
    pub commission: Decimal,
    pub duration_seconds: i64,
    pub executed_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Signal {
    pub sgid: i64,
    pub action: SignalAction,
    pub symbol: Option<String>,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub strength: Option<Decimal>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized per-user balance cache. Refreshed opportunistically
/// whenever the fan-out engine already has a fresh balance read in hand;
/// not authoritative for anything — the upstream balance call is always
/// the source of truth at order time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountSnapshot {
    pub uid: i64,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Computed holding time as of `now`, used by the supervisor's
    /// max-holding-time rule. Measured from `executed_at`, falling back to
    /// `created_at` for an order that somehow never recorded an execution
    /// timestamp.
    pub fn holding_seconds(&self, now: DateTime<Utc>) -> i64 {
        let since = self.executed_at.unwrap_or(self.created_at);
        (now - since).num_seconds().max(0)
    }
}
