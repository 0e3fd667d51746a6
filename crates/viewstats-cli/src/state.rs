use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use viewstats_core::config::{Config, LockBackendKind};
use viewstats_core::lock::{LockBackend, MemoryLockBackend, PassThroughLock, RecomputeLock};
use viewstats_core::query::{QueryOptions, QueryService};
use viewstats_core::summary::{DistinctMode, ScopeConfig};
use viewstats_duckdb::DuckDbBackend;

use crate::error::CliError;

/// Shared handles for one invocation: the store, the parsed configuration,
/// the recompute lock and the query service built from it.
pub struct AppState {
    pub db: Arc<DuckDbBackend>,
    pub config: Arc<Config>,
    pub lock: RecomputeLock,
    queries: Arc<QueryService>,
}

impl AppState {
    /// Open the DuckDB file under `config.data_dir`, creating the directory
    /// if needed.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = format!("{}/viewstats.db", config.data_dir);
        let db = DuckDbBackend::open(&db_path, &config.duckdb_memory_limit)?;
        Ok(Self::new(db, config))
    }

    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        let db = Arc::new(db);
        let backend: Arc<dyn LockBackend> = match config.lock_backend {
            LockBackendKind::Store => db.clone(),
            LockBackendKind::Memory => Arc::new(MemoryLockBackend::new()),
            LockBackendKind::None => {
                warn!("Lock backend disabled (VIEWSTATS_LOCK_BACKEND=none); concurrent recomputes are not excluded");
                Arc::new(PassThroughLock)
            }
        };
        let lock = RecomputeLock::new(backend, config.lock_timeout(), config.lock_ttl());
        info!(lock_backend = lock.backend_kind(), "Recompute lock ready");
        let queries = Arc::new(QueryService::new(
            db.clone(),
            QueryOptions {
                scopes: ScopeConfig::defaults(config.distinct_mode),
                cache_ttl: config.query_cache_ttl(),
            },
        ));
        Self {
            db,
            config: Arc::new(config),
            lock,
            queries,
        }
    }

    /// Configured scopes, narrowed to `names` when given.
    pub fn scopes(&self, names: &[String], approximate: bool) -> Result<Vec<ScopeConfig>, CliError> {
        let mode = if approximate {
            DistinctMode::Approximate
        } else {
            self.config.distinct_mode
        };
        let all = ScopeConfig::defaults(mode);
        if names.is_empty() {
            return Ok(all);
        }
        names
            .iter()
            .map(|name| {
                all.iter()
                    .find(|scope| scope.name == *name)
                    .cloned()
                    .ok_or_else(|| CliError::InvalidArgs(format!("unknown scope '{name}'")))
            })
            .collect()
    }

    pub fn query_service(&self) -> Arc<QueryService> {
        Arc::clone(&self.queries)
    }
}
