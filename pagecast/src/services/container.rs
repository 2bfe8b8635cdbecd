//! Service container for dependency injection.
//!
//! Wires the store façade, leases, registries and invoker together once so
//! the dispatcher, stage workers and the sweep share the same instances.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::CoordinatorConfig;
use crate::control::ControlChannel;
use crate::heartbeat::HeartbeatRegistry;
use crate::invoker::StageInvoker;
use crate::lease::LeaseLock;
use crate::registry::{TaskRegistry, UpdateLockSettings};
use crate::store::{Store, StoreClient};

/// Shared coordinator services.
#[derive(Clone)]
pub struct ServiceContainer {
    pub config: Arc<CoordinatorConfig>,
    pub store: Arc<StoreClient>,
    pub locks: LeaseLock,
    pub tasks: TaskRegistry,
    pub heartbeats: HeartbeatRegistry,
    pub control: ControlChannel,
    pub invoker: Arc<dyn StageInvoker>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub async fn new(
        backend: Arc<dyn Store>,
        invoker: Arc<dyn StageInvoker>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        info!("Initializing service container");

        let store = Arc::new(StoreClient::connect(backend, config.store.retry.clone()).await?);
        let locks = LeaseLock::new(store.clone());

        let tasks = TaskRegistry::new(store.clone(), locks.clone())
            .with_update_lock(UpdateLockSettings {
                ttl: Duration::from_millis(config.lease.update_ttl_ms),
                retry_count: config.lease.update_retry_count,
                retry_delay: Duration::from_millis(config.lease.update_retry_delay_ms),
            })
            .with_record_ttl(config.task_ttl());

        let heartbeats = HeartbeatRegistry::new(
            store.clone(),
            config.heartbeat.interval(),
            config.heartbeat.staleness_buffer(),
        );
        let control = ControlChannel::new(store.clone());

        Ok(Self {
            config: Arc::new(config),
            store,
            locks,
            tasks,
            heartbeats,
            control,
            invoker,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Root token; cancelling it stops every background task spawned from it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn shutdown(&self) {
        info!("Shutting down coordinator services");
        self.cancellation_token.cancel();
    }
}
