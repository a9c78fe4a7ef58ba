//! # System Context
//!
//! Builds the resilience core from one [`WardenConfig`] and hands out shared
//! handles: the degradation coordinator, the connection manager, the unified
//! cache and the circuit breaker manager.

use crate::cache::UnifiedCache;
use crate::config::{ConfigLoader, QueueBackendKind, WardenConfig};
use crate::database::{ConnectionManager, PgConnector, SqlConnector};
use crate::degradation::{DegradationCoordinator, WriteQueue};
use crate::error::{WardenError, WardenResult};
use crate::resilience::CircuitBreakerManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct WardenContext {
    pub shard_id: u32,
    pub config: Arc<WardenConfig>,
    pub coordinator: Arc<DegradationCoordinator>,
    pub database: Arc<ConnectionManager>,
    pub cache: Arc<UnifiedCache>,
    /// `None` when circuit breakers are disabled
    pub circuit_breakers: Option<Arc<CircuitBreakerManager>>,
}

impl std::fmt::Debug for WardenContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenContext")
            .field("shard_id", &self.shard_id)
            .field("environment", &self.config.environment)
            .field("coordinator", &self.coordinator)
            .field(
                "circuit_breakers",
                &self
                    .circuit_breakers
                    .as_ref()
                    .map(|_| "Some(Arc<CircuitBreakerManager>)")
                    .unwrap_or("None"),
            )
            .finish()
    }
}

impl WardenContext {
    /// Loads configuration from files and environment, then bootstraps
    pub async fn new() -> WardenResult<Self> {
        let config = ConfigLoader::load()
            .map_err(|e| WardenError::ConfigurationError(format!("Failed to load configuration: {e}")))?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: WardenConfig) -> WardenResult<Self> {
        Self::with_connector(config, Arc::new(PgConnector)).await
    }

    /// Bootstraps with a custom database connector
    pub async fn with_connector(config: WardenConfig, connector: Arc<dyn SqlConnector>) -> WardenResult<Self> {
        config
            .validate()
            .map_err(|e| WardenError::ConfigurationError(e.to_string()))?;
        let shard_id = config.shard_id;
        info!(
            shard_id = shard_id,
            environment = %config.environment,
            "Initializing Warden context"
        );

        let queue = Self::write_queue(&config).await?;
        let coordinator = Arc::new(DegradationCoordinator::new(&config.degradation, shard_id, queue));

        let database = Arc::new(ConnectionManager::with_connector(
            config.database.clone(),
            Arc::clone(&coordinator),
            connector,
        )?);
        database.initialize().await?;

        let cache = UnifiedCache::connect(config.cache.clone(), Arc::clone(&coordinator)).await?;

        let circuit_breakers = config
            .circuit_breakers
            .enabled
            .then(|| Arc::new(CircuitBreakerManager::from_settings(&config.circuit_breakers)));

        info!(shard_id = shard_id, "Warden context ready");
        Ok(Self {
            shard_id,
            config: Arc::new(config),
            coordinator,
            database,
            cache,
            circuit_breakers,
        })
    }

    /// The configured queue; memory only when asked for or when no Redis URL
    /// is configured. An unreachable Redis keeps the Redis queue, which
    /// reconnects on its next call.
    async fn write_queue(config: &WardenConfig) -> WardenResult<WriteQueue> {
        let shard_id = config.shard_id;
        match (config.degradation.queue_backend, config.cache.redis_url.as_deref()) {
            (QueueBackendKind::Memory, _) => Ok(WriteQueue::in_memory(shard_id)),
            (QueueBackendKind::Shared, None) => {
                warn!("Shared write queue requested without cache.redis_url; using memory");
                Ok(WriteQueue::in_memory(shard_id))
            }
            (QueueBackendKind::Shared, Some(url)) => {
                let queue = WriteQueue::redis_lazy(url, &config.cache.key_prefix, shard_id)?;
                if let Err(e) = queue.len().await {
                    error!(error = %e, "Shared write queue unreachable at startup; deferring fails until Redis is back");
                }
                Ok(queue)
            }
        }
    }

    /// Starts the coordinator and cache sweeps on their configured intervals
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.coordinator
                .spawn_maintenance(self.coordinator.sweep_interval()),
            self.cache.spawn_maintenance(self.config.cache.sweep_interval()),
        ]
    }

    pub async fn shutdown(&self) {
        info!(shard_id = self.shard_id, "Shutting down Warden context");
        self.database.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::services;
    use crate::test_utils::{MockBackend, MockConnector};

    fn memory_config() -> WardenConfig {
        let mut config = WardenConfig::default();
        config.shard_id = 4;
        config.degradation.queue_backend = QueueBackendKind::Memory;
        config
    }

    #[tokio::test]
    async fn test_bootstrap_wires_components() {
        let backend = Arc::new(MockBackend::new());
        let context = WardenContext::with_connector(memory_config(), Arc::new(MockConnector::new(backend)))
            .await
            .unwrap();

        assert_eq!(context.coordinator.shard_id(), 4);
        assert_eq!(context.coordinator.queue().backend_name(), "memory");
        assert!(context.coordinator.is_healthy(services::DATABASE));
        assert!(context.database.is_initialized());
        assert!(!context.cache.has_shared_tier());
        assert!(context.circuit_breakers.is_some());

        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_queue_without_url_falls_back_to_memory() {
        let mut config = memory_config();
        config.degradation.queue_backend = QueueBackendKind::Shared;
        let queue = WardenContext::write_queue(&config).await.unwrap();
        assert_eq!(queue.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_shared_queue_stays_on_redis() {
        let mut config = memory_config();
        config.degradation.queue_backend = QueueBackendKind::Shared;
        config.cache.redis_url = Some("redis://127.0.0.1:1".to_string());
        let queue = WardenContext::write_queue(&config).await.unwrap();
        assert_eq!(queue.backend_name(), "redis");
    }

    #[tokio::test]
    async fn test_malformed_queue_url_fails_startup() {
        let mut config = memory_config();
        config.degradation.queue_backend = QueueBackendKind::Shared;
        config.cache.redis_url = Some("not a url".to_string());
        assert!(matches!(
            WardenContext::write_queue(&config).await,
            Err(WardenError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_breakers_are_absent() {
        let mut config = memory_config();
        config.circuit_breakers.enabled = false;
        let backend = Arc::new(MockBackend::new());
        let context = WardenContext::with_connector(config, Arc::new(MockConnector::new(backend)))
            .await
            .unwrap();
        assert!(context.circuit_breakers.is_none());
    }
}
