//! Lease-based recompute lock stored in the `recompute_locks` table.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use viewstats_core::lock::{LockBackend, LockHandle};

use crate::backend::format_timestamp;
use crate::DuckDbBackend;

impl DuckDbBackend {
    /// Clear an expired lease for `scope`, then try to insert ours.
    ///
    /// Returns `None` when a live lease belongs to someone else.
    pub async fn try_acquire_lease(&self, scope: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        let handle = LockHandle::new(scope);

        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM recompute_locks WHERE scope = ?1 AND expires_at <= CAST(?2 AS TIMESTAMP)",
            duckdb::params![scope, format_timestamp(&now)],
        )?;
        conn.execute(
            r#"INSERT INTO recompute_locks (scope, owner, expires_at)
               VALUES (?1, ?2, CAST(?3 AS TIMESTAMP))
               ON CONFLICT (scope) DO NOTHING"#,
            duckdb::params![scope, handle.owner, format_timestamp(&expires_at)],
        )?;
        let owner: String = conn.query_row(
            "SELECT owner FROM recompute_locks WHERE scope = ?1",
            duckdb::params![scope],
            |row| row.get(0),
        )?;

        Ok((owner == handle.owner).then_some(handle))
    }

    /// Delete the lease only if `handle` still owns it.
    pub async fn release_lease(&self, handle: &LockHandle) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM recompute_locks WHERE scope = ?1 AND owner = ?2",
            duckdb::params![handle.scope, handle.owner],
        )?;
        Ok(())
    }

    /// Extend the lease if `handle` still owns it.
    pub async fn renew_lease(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"UPDATE recompute_locks SET expires_at = CAST(?1 AS TIMESTAMP)
               WHERE scope = ?2 AND owner = ?3"#,
            duckdb::params![format_timestamp(&expires_at), handle.scope, handle.owner],
        )?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl LockBackend for DuckDbBackend {
    fn kind(&self) -> &'static str {
        "store"
    }

    async fn acquire(&self, scope: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        self.try_acquire_lease(scope, ttl).await
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        self.release_lease(handle).await
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        self.renew_lease(handle, ttl).await
    }
}
