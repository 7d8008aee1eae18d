// =============================================================================
// AppState — shared handles wired together behind Arc
// =============================================================================
//
// The single source of truth for the orchestrator process. Every subsystem
// owns its own interior mutability (`SessionPool`'s cache mutex,
// `EventBus`'s channel map); `AppState` just bundles the `Arc`s so HTTP
// handlers and background loops can all reach the same instances.
// =============================================================================

use std::sync::Arc;

use crate::config::AppConfig;
use crate::event_bus::EventBus;
use crate::fanout::FanOutEngine;
use crate::repository::Repository;
use crate::scheduler::Scheduler;
use crate::session_pool::SessionPool;
use crate::supervisor::PositionSupervisor;
use crate::upstream::UpstreamClient;
use crate::vault::CredentialVault;

pub struct AppState {
    pub config: AppConfig,
    pub repository: Arc<dyn Repository>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub vault: Arc<CredentialVault>,
    pub sessions: Arc<SessionPool>,
    pub fanout: Arc<FanOutEngine>,
    pub supervisor: Arc<PositionSupervisor>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repository: Arc<dyn Repository>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Result<Arc<Self>, crate::error::ConfigError> {
        let vault = Arc::new(
            CredentialVault::new(&config.encryption_key)
                .map_err(|e| crate::error::ConfigError(format!("vault init failed: {e}")))?,
        );

        let sessions = Arc::new(SessionPool::new(
            repository.clone(),
            upstream.clone(),
            vault.clone(),
            config.session_max_retry_attempts,
        ));

        let bus = Arc::new(EventBus::new());

        let fanout = Arc::new(FanOutEngine::new(
            repository.clone(),
            upstream.clone(),
            sessions.clone(),
            bus.clone(),
        ));

        let supervisor = Arc::new(PositionSupervisor::new(
            repository.clone(),
            upstream.clone(),
            sessions.clone(),
            fanout.clone(),
            bus.clone(),
            config.supervisor_policy,
        ));

        let scheduler = Arc::new(Scheduler::new(
            sessions.clone(),
            supervisor.clone(),
            bus.clone(),
            config.session_refresh_interval_minutes,
        ));

        Ok(Arc::new(Self {
            config,
            repository,
            upstream,
            vault,
            sessions,
            fanout,
            supervisor,
            bus,
            scheduler,
        }))
    }
}
