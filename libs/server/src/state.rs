//! Shared server state.

use std::sync::Arc;

use voxd_db::{Backend, LoadStats, RepoManager, Result, TypeRegistry};

use crate::config::Config;

/// Everything the route handlers need, shared via `State(Arc<AppState>)`.
pub struct AppState {
    pub manager: Arc<RepoManager>,
    pub registry: Arc<TypeRegistry>,
    pub backend: Arc<Backend>,
    pub stats: Arc<LoadStats>,
    /// Process-wide read-only flag, fixed at startup.
    pub readonly: bool,
    pub allow_timing: bool,
    pub host: String,
}

impl AppState {
    /// Wire up the process in dependency order: storage backend, then the
    /// repo manager (restoring persisted repos), then the type registry.
    pub fn init(config: &Config, readonly: bool) -> Result<Arc<Self>> {
        let stats = LoadStats::new();
        let backend = config.open_backend(stats.clone())?;
        let manager = RepoManager::open(backend.metadata().clone(), config.instance_id_config())?;
        let registry = TypeRegistry::builtin();

        Ok(Arc::new(Self {
            manager: Arc::new(manager),
            registry: Arc::new(registry),
            backend: Arc::new(backend),
            stats,
            readonly,
            allow_timing: config.server.allow_timing,
            host: config.server.host.clone(),
        }))
    }
}
