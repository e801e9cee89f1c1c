// One handle over the whole substrate: store, guards, and every subsystem
// wired together, the way a host process embeds the core.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use hive_guard::{RateLimiter, RateLimiterConfig};

use crate::audit::AuditLog;
use crate::ballot::VotingEngine;
use crate::board::JobBoard;
use crate::broadcast::BroadcastTracker;
use crate::broker::MessageBroker;
use crate::db::CoordStore;
use crate::error::CoordResult;
use crate::maintenance::Maintenance;
use crate::registry::AgentRegistry;

pub struct Coordinator {
    store: Arc<CoordStore>,
    pub broker: MessageBroker,
    pub broadcasts: BroadcastTracker,
    pub board: JobBoard,
    pub voting: VotingEngine,
    pub registry: AgentRegistry,
    pub audit: AuditLog,
    pub maintenance: Maintenance,
}

impl Coordinator {
    /// Open (or create) the coordination state under `root`.
    pub async fn open(root: impl AsRef<Path>) -> CoordResult<Self> {
        Self::open_with_limits(root, RateLimiterConfig::default()).await
    }

    pub async fn open_with_limits(
        root: impl AsRef<Path>,
        limits: RateLimiterConfig,
    ) -> CoordResult<Self> {
        let store = Arc::new(CoordStore::open(root).await?);
        let limiter = Arc::new(RateLimiter::new(limits));
        let broker = MessageBroker::new(store.clone(), limiter);
        Ok(Self {
            broadcasts: BroadcastTracker::new(store.clone()),
            board: JobBoard::new(store.clone()),
            voting: VotingEngine::new(store.clone(), broker.clone()),
            registry: AgentRegistry::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            maintenance: Maintenance::new(store.clone()),
            broker,
            store,
        })
    }

    pub fn store(&self) -> &Arc<CoordStore> {
        &self.store
    }

    /// Start the per-process maintenance loop.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        self.maintenance.clone().spawn(interval)
    }
}
