use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tide_protocol::ServerStatus;
use tide_store::StorageBackend;
use tide_types::Tid;

use crate::auth::Authenticator;
use crate::broadcast::InvalidationBroadcaster;
use crate::config::ServerConfig;
use crate::coordinator::CommitCoordinator;
use crate::error::ServerResult;

/// Everything the connections of one store share.
pub struct StoreContext {
    config: ServerConfig,
    coordinator: Arc<CommitCoordinator>,
    broadcaster: Arc<InvalidationBroadcaster>,
    authenticator: Arc<dyn Authenticator>,
    loads: AtomicU64,
}

impl StoreContext {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn StorageBackend>,
        authenticator: Arc<dyn Authenticator>,
    ) -> ServerResult<Self> {
        let current = backend.current_tid()?;
        let broadcaster = Arc::new(InvalidationBroadcaster::new(
            config.invalidation_history,
            current,
        ));
        let coordinator = Arc::new(CommitCoordinator::new(
            config.store_name.clone(),
            backend,
            Arc::clone(&broadcaster),
            config.coordinator_config(),
        )?);
        Ok(Self {
            config,
            coordinator,
            broadcaster,
            authenticator,
            loads: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.store_name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<CommitCoordinator> {
        &self.coordinator
    }

    pub fn broadcaster(&self) -> &Arc<InvalidationBroadcaster> {
        &self.broadcaster
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        self.coordinator.backend()
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> ServerResult<ServerStatus> {
        let stats = self.coordinator.stats();
        Ok(ServerStatus {
            store: self.name().to_string(),
            current_tid: self.backend().current_tid()?,
            sessions: self.broadcaster.subscriber_count(),
            active_transactions: self.coordinator.active_transactions(),
            lock_waiters: self.coordinator.lock().waiters(),
            commits: stats.commits(),
            aborts: stats.aborts(),
            conflicts: stats.conflicts(),
            loads: self.loads.load(Ordering::Relaxed),
            invalidations_sent: self.broadcaster.sent_count(),
            session_tid: Tid::ZERO,
        })
    }
}
