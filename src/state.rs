use std::sync::Arc;

use crate::{
    auth::{KeyStore, StaticKeyStore},
    config::GatewayConfig,
    feature::BackendTable,
    metrics::AppMetrics,
    registry::WorkerRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub backends: Arc<BackendTable>,
    pub keys: Arc<dyn KeyStore>,
    pub metrics: Arc<AppMetrics>,
    pub default_max_tokens: u32,
}

impl AppState {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            registry: Arc::new(WorkerRegistry::new(config.worker_mode, config.timeouts)),
            backends: Arc::new(config.backends.clone()),
            keys: Arc::new(StaticKeyStore::from_env()),
            metrics: Arc::new(AppMetrics::new()),
            default_max_tokens: config.default_max_tokens,
        }
    }

    /// State wired to an explicit registry and key store, for tests and embedding.
    pub fn with_parts(
        registry: Arc<WorkerRegistry>,
        keys: Arc<dyn KeyStore>,
        backends: BackendTable,
    ) -> Self {
        Self {
            registry,
            backends: Arc::new(backends),
            keys,
            metrics: Arc::new(AppMetrics::new()),
            default_max_tokens: GatewayConfig::default().default_max_tokens,
        }
    }
}
