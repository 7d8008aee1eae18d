// =============================================================================
// Repository — durable storage for User, Session, Order, Trade, Signal
// =============================================================================
//
// A connect-with-retry pool plus a narrow async trait, so the rest of the
// crate depends on behaviour, not directly on sqlx.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::models::{AccountSnapshot, Order, Session, Signal, Trade, User};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, uid: i64) -> Result<Option<User>, StorageError>;
    async fn list_active_users(&self) -> Result<Vec<User>, StorageError>;

    async fn get_active_session(&self, uid: i64) -> Result<Option<Session>, StorageError>;
    async fn list_active_sessions(&self) -> Result<Vec<Session>, StorageError>;
    /// Upserts the active session for `uid`, maintaining the invariant that
    /// at most one row is active per user (updates in place if one exists).
    async fn upsert_active_session(&self, session: Session) -> Result<Session, StorageError>;
    async fn deactivate_session(&self, sid: i64) -> Result<(), StorageError>;

    async fn insert_signal(&self, signal: Signal) -> Result<Signal, StorageError>;

    async fn insert_order(&self, order: Order) -> Result<Order, StorageError>;
    async fn get_order_by_upstream_id(
        &self,
        upstream_id: &str,
    ) -> Result<Option<Order>, StorageError>;
    /// Most recent order for `(uid, symbol)` with `status = OPEN`, used for
    /// symbol-fallback reconciliation when `upstream_id` has no match.
    async fn most_recent_open_order(
        &self,
        uid: i64,
        symbol: &str,
    ) -> Result<Option<Order>, StorageError>;
    async fn list_open_orders(&self) -> Result<Vec<Order>, StorageError>;
    async fn list_open_orders_for_user(&self, uid: i64) -> Result<Vec<Order>, StorageError>;
    async fn list_trades(
        &self,
        uid: Option<i64>,
        symbol: Option<&str>,
    ) -> Result<Vec<Trade>, StorageError>;

    /// Closes `oid` and inserts `trade` in a single transaction. Either both
    /// writes land or neither does — a closed order with no matching trade
    /// row, or a trade row pointing at an order that never closed, would
    /// both be visible to any concurrent reader.
    async fn record_trade(
        &self,
        oid: i64,
        upstream_id: Option<String>,
        closed_at: DateTime<Utc>,
        trade: Trade,
    ) -> Result<(Order, Trade), StorageError>;

    /// Refreshes the denormalized balance cache row for `uid`. Best-effort
    /// from the caller's point of view — no operation depends on reading
    /// this back.
    async fn upsert_account_balance(
        &self,
        uid: i64,
        balance: Decimal,
    ) -> Result<AccountSnapshot, StorageError>;
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connects and waits for the schema to be ready, retrying up to 10
    /// times with a 3-second delay — matching the original `init_db()`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        const MAX_ATTEMPTS: u32 = 10;
        const DELAY: std::time::Duration = std::time::Duration::from_secs(3);
        for attempt in 1..=MAX_ATTEMPTS {
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => {
                    info!(attempt, "database reachable");
                    break;
                }
                Err(e) if attempt == MAX_ATTEMPTS => {
                    return Err(StorageError(format!(
                        "database not reachable after {MAX_ATTEMPTS} attempts: {e}"
                    )));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "database not yet reachable, retrying");
                    tokio::time::sleep(DELAY).await;
                }
            }
        }

        Ok(Self { pool })
    }

    /// Runs the migrations embedded under `migrations/`.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError(e.to_string()))
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_user(&self, uid: i64) -> Result<Option<User>, StorageError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_active_users(&self) -> Result<Vec<User>, StorageError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE active = true")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn get_active_session(&self, uid: i64) -> Result<Option<Session>, StorageError> {
        Ok(sqlx::query_as::<_, Session>(
            "SELECT * FROM user_sessions WHERE uid = $1 AND active = true",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>, StorageError> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM user_sessions WHERE active = true")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn upsert_active_session(&self, session: Session) -> Result<Session, StorageError> {
        let existing = self.get_active_session(session.uid).await?;
        if let Some(existing) = existing {
            Ok(sqlx::query_as::<_, Session>(
                r#"UPDATE user_sessions SET auth_token = $1, trading_token = $2,
                   trading_account_id = $3, login_at = $4, expires_at = $5,
                   last_refresh_at = $6, active = true
                   WHERE sid = $7 RETURNING *"#,
            )
            .bind(&session.auth_token)
            .bind(&session.trading_token)
            .bind(&session.trading_account_id)
            .bind(session.login_at)
            .bind(session.expires_at)
            .bind(session.last_refresh_at)
            .bind(existing.sid)
            .fetch_one(&self.pool)
            .await?)
        } else {
            Ok(sqlx::query_as::<_, Session>(
                r#"INSERT INTO user_sessions
                   (uid, active, auth_token, trading_token, trading_account_id,
                    login_at, expires_at, last_refresh_at)
                   VALUES ($1, true, $2, $3, $4, $5, $6, $7) RETURNING *"#,
            )
            .bind(session.uid)
            .bind(&session.auth_token)
            .bind(&session.trading_token)
            .bind(&session.trading_account_id)
            .bind(session.login_at)
            .bind(session.expires_at)
            .bind(session.last_refresh_at)
            .fetch_one(&self.pool)
            .await?)
        }
    }

    async fn deactivate_session(&self, sid: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE user_sessions SET active = false WHERE sid = $1")
            .bind(sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_signal(&self, signal: Signal) -> Result<Signal, StorageError> {
        Ok(sqlx::query_as::<_, Signal>(
            r#"INSERT INTO trading_signals
               (action, symbol, entry_price, stop_loss, take_profit, strength, reason, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *"#,
        )
        .bind(signal.action)
        .bind(&signal.symbol)
        .bind(signal.entry_price)
        .bind(signal.stop_loss)
        .bind(signal.take_profit)
        .bind(signal.strength)
        .bind(&signal.reason)
        .bind(signal.created_at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn insert_order(&self, order: Order) -> Result<Order, StorageError> {
        Ok(sqlx::query_as::<_, Order>(
            r#"INSERT INTO orders
               (uid, upstream_id, symbol, side, order_type, quantity, entry_price,
                stop_loss, take_profit, status, created_at, executed_at, closed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               RETURNING *"#,
        )
        .bind(order.uid)
        .bind(&order.upstream_id)
        .bind(&order.symbol)
        .bind(order.side)
        .bind(order.order_type)
        .bind(order.quantity)
        .bind(order.entry_price)
        .bind(order.stop_loss)
        .bind(order.take_profit)
        .bind(order.status)
        .bind(order.created_at)
        .bind(order.executed_at)
        .bind(order.closed_at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_order_by_upstream_id(
        &self,
        upstream_id: &str,
    ) -> Result<Option<Order>, StorageError> {
        Ok(
            sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE upstream_id = $1")
                .bind(upstream_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn most_recent_open_order(
        &self,
        uid: i64,
        symbol: &str,
    ) -> Result<Option<Order>, StorageError> {
        Ok(sqlx::query_as::<_, Order>(
            r#"SELECT * FROM orders
               WHERE uid = $1 AND symbol = $2 AND status = 'OPEN'
               ORDER BY created_at DESC, oid DESC
               LIMIT 1"#,
        )
        .bind(uid)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_open_orders(&self) -> Result<Vec<Order>, StorageError> {
        Ok(
            sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE status = 'OPEN'")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn list_open_orders_for_user(&self, uid: i64) -> Result<Vec<Order>, StorageError> {
        Ok(sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE uid = $1 AND status = 'OPEN'",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_trades(
        &self,
        uid: Option<i64>,
        symbol: Option<&str>,
    ) -> Result<Vec<Trade>, StorageError> {
        Ok(sqlx::query_as::<_, Trade>(
            r#"SELECT * FROM trades
               WHERE ($1::bigint IS NULL OR uid = $1)
                 AND ($2::text IS NULL OR symbol = $2)
               ORDER BY closed_at DESC"#,
        )
        .bind(uid)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_account_balance(
        &self,
        uid: i64,
        balance: Decimal,
    ) -> Result<AccountSnapshot, StorageError> {
        Ok(sqlx::query_as::<_, AccountSnapshot>(
            r#"INSERT INTO accounts (uid, balance, updated_at)
               VALUES ($1, $2, now())
               ON CONFLICT (uid) DO UPDATE
                   SET balance = EXCLUDED.balance, updated_at = EXCLUDED.updated_at
               RETURNING *"#,
        )
        .bind(uid)
        .bind(balance)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn record_trade(
        &self,
        oid: i64,
        upstream_id: Option<String>,
        closed_at: DateTime<Utc>,
        trade: Trade,
    ) -> Result<(Order, Trade), StorageError> {
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, Order>(
            r#"UPDATE orders
               SET status = 'CLOSED', closed_at = $1,
                   upstream_id = COALESCE(upstream_id, $2)
               WHERE oid = $3 RETURNING *"#,
        )
        .bind(closed_at)
        .bind(upstream_id)
        .bind(oid)
        .fetch_one(&mut *tx)
        .await?;

        let trade = sqlx::query_as::<_, Trade>(
            r#"INSERT INTO trades
               (oid, uid, symbol, side, entry_price, exit_price, quantity,
                profit_loss, profit_loss_percent, commission, duration_seconds,
                executed_at, closed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               RETURNING *"#,
        )
        .bind(trade.oid)
        .bind(trade.uid)
        .bind(&trade.symbol)
        .bind(trade.side)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.quantity)
        .bind(trade.profit_loss)
        .bind(trade.profit_loss_percent)
        .bind(trade.commission)
        .bind(trade.duration_seconds)
        .bind(trade.executed_at)
        .bind(trade.closed_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((order, trade))
    }
}
