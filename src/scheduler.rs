// =============================================================================
// Scheduler — the four background ticks driving the orchestrator
// =============================================================================
//
// One loop per tick, each independently catching its own errors, logging,
// and sleeping past them rather than exiting. Shutdown is cooperative via a
// `CancellationToken`: `main.rs` waits on `tokio::signal::ctrl_c()` directly
// and cancels the token on receipt, so each loop here reacts to shutdown
// without knowing anything about the signal handler.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::event_bus::EventBus;
use crate::session_pool::SessionPool;
use crate::supervisor::PositionSupervisor;

const ERROR_BACKOFF: Duration = Duration::from_secs(60);
const POSITION_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Scheduler {
    sessions: Arc<SessionPool>,
    supervisor: Arc<PositionSupervisor>,
    bus: Arc<EventBus>,
    refresh_interval: Duration,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        sessions: Arc<SessionPool>,
        supervisor: Arc<PositionSupervisor>,
        bus: Arc<EventBus>,
        refresh_interval_minutes: u64,
    ) -> Self {
        Self {
            sessions,
            supervisor,
            bus,
            refresh_interval: Duration::from_secs(refresh_interval_minutes * 60),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the four background loops and returns immediately; callers
    /// hold on to `self` (or its `CancellationToken`) to request shutdown.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let h1 = tokio::spawn(async move { this.session_refresh_loop().await });

        let this = self.clone();
        let h2 = tokio::spawn(async move { this.session_health_loop().await });

        let this = self.clone();
        let h3 = tokio::spawn(async move { this.position_monitoring_loop().await });

        let this = self.clone();
        let h4 = tokio::spawn(async move { this.heartbeat_loop().await });

        self.handles.lock().extend([h1, h2, h3, h4]);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals cancellation and waits for all four loops to actually exit
    /// their `select!` and return, rather than just requesting it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop task panicked during shutdown");
            }
        }
    }

    async fn session_refresh_loop(self: Arc<Self>) {
        let mut tick = interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("session refresh loop stopping");
                    return;
                }
                _ = tick.tick() => {}
            }

            match self.sessions.refresh_all().await {
                Ok(result) => {
                    info!(successes = result.successes, failures = result.failures, "session refresh complete");
                    self.bus
                        .publish_session_update(
                            "tokens_refreshed",
                            serde_json::json!({
                                "successful": result.successes,
                                "failed": result.failures,
                            }),
                        )
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "session refresh loop error, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn session_health_loop(self: Arc<Self>) {
        let mut tick = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("session health loop stopping");
                    return;
                }
                _ = tick.tick() => {}
            }

            match self.sessions.sweep().await {
                Ok(result) => {
                    self.bus
                        .publish_session_update(
                            "session_health",
                            serde_json::json!({
                                "healthy": result.healthy.len(),
                                "expiring_soon": result.expiring_soon.len(),
                                "expired": result.expired.len(),
                            }),
                        )
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "session health loop error, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn position_monitoring_loop(self: Arc<Self>) {
        let mut tick = interval(POSITION_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("position monitoring loop stopping");
                    return;
                }
                _ = tick.tick() => {}
            }

            let result = self.supervisor.tick().await;
            if result.errors > 0 {
                warn!(
                    checked = result.checked,
                    closed = result.closed,
                    errors = result.errors,
                    "position monitoring tick completed with errors"
                );
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("heartbeat loop stopping");
                    return;
                }
                _ = tick.tick() => {}
            }
            self.bus.heartbeat().await;
        }
    }
}
