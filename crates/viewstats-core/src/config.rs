use std::time::Duration;

use crate::summary::DistinctMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub distinct_mode: DistinctMode,
    pub lock_backend: LockBackendKind,
    pub lock_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    /// `0` disables the query result cache.
    pub query_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackendKind {
    /// Lease rows in the DuckDB `recompute_locks` table.
    Store,
    /// In-process lease map. Only excludes runs inside one process.
    Memory,
    /// No mutual exclusion. Single-process / development use only.
    None,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any `VIEWSTATS_*` lookup; unset keys take their defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let secs = |key: &str, default: u64| -> Result<u64, String> {
            match var(key) {
                Some(raw) => raw.trim().parse().map_err(|e| format!("invalid {key}: {raw} ({e})")),
                None => Ok(default),
            }
        };
        let defaults = Self::default();

        Ok(Self {
            data_dir: var("VIEWSTATS_DATA_DIR").unwrap_or(defaults.data_dir),
            duckdb_memory_limit: var("VIEWSTATS_DUCKDB_MEMORY")
                .unwrap_or(defaults.duckdb_memory_limit),
            distinct_mode: match var("VIEWSTATS_DISTINCT_MODE") {
                Some(raw) => DistinctMode::parse(&raw)
                    .ok_or_else(|| format!("invalid VIEWSTATS_DISTINCT_MODE: {raw}"))?,
                None => defaults.distinct_mode,
            },
            lock_backend: match var("VIEWSTATS_LOCK_BACKEND").as_deref() {
                None | Some("store") => LockBackendKind::Store,
                Some("memory") => LockBackendKind::Memory,
                Some("none") => LockBackendKind::None,
                Some(other) => return Err(format!("invalid VIEWSTATS_LOCK_BACKEND: {other}")),
            },
            lock_timeout_secs: secs("VIEWSTATS_LOCK_TIMEOUT_SECS", defaults.lock_timeout_secs)?,
            lock_ttl_secs: secs("VIEWSTATS_LOCK_TTL_SECS", defaults.lock_ttl_secs)?,
            query_cache_ttl_secs: secs(
                "VIEWSTATS_QUERY_CACHE_TTL_SECS",
                defaults.query_cache_ttl_secs,
            )?,
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn query_cache_ttl(&self) -> Option<Duration> {
        (self.query_cache_ttl_secs > 0).then(|| Duration::from_secs(self.query_cache_ttl_secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "1GB".to_string(),
            distinct_mode: DistinctMode::Exact,
            lock_backend: LockBackendKind::Store,
            lock_timeout_secs: 10,
            lock_ttl_secs: 3600,
            query_cache_ttl_secs: 900,
        }
    }
}
