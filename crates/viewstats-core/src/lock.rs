//! Recompute lock: at most one aggregation run per scope at a time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Generate a random hex string of `n` bytes (2n hex chars).
pub fn rand_hex(n: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Proof of a held lease. Release only removes a lease with the same owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub scope: String,
    pub owner: String,
}

impl LockHandle {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            owner: rand_hex(16),
        }
    }
}

/// An advisory lock primitive keyed by an arbitrary scope string.
///
/// `acquire` never waits: it returns `Ok(None)` when someone else holds the
/// scope. Leases expire after `ttl` so a crashed holder cannot block a scope
/// forever.
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn acquire(&self, scope: &str, ttl: Duration) -> Result<Option<LockHandle>>;

    async fn release(&self, handle: &LockHandle) -> Result<()>;

    /// Push the lease's expiry to `now + ttl`. `Ok(false)` when `handle` no
    /// longer owns the scope.
    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool>;
}

/// Set-if-absent lease map with TTL, shared by every run inside one process.
#[derive(Default)]
pub struct MemoryLockBackend {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, scope: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if leases.get(scope).is_some_and(|(_, expires)| *expires > now) {
            return Ok(None);
        }
        let handle = LockHandle::new(scope);
        leases.insert(scope.to_string(), (handle.owner.clone(), now + ttl));
        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&handle.scope)
            .is_some_and(|(owner, _)| *owner == handle.owner)
        {
            leases.remove(&handle.scope);
        }
        Ok(())
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&handle.scope) {
            Some((owner, expires)) if *owner == handle.owner => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Degraded mode: every acquire succeeds and nothing is excluded.
///
/// For single-process and development setups without a lock backend. Each
/// acquisition logs a warning so the missing exclusion is visible.
pub struct PassThroughLock;

#[async_trait]
impl LockBackend for PassThroughLock {
    fn kind(&self) -> &'static str {
        "none"
    }

    async fn acquire(&self, scope: &str, _ttl: Duration) -> Result<Option<LockHandle>> {
        warn!(
            scope,
            "No lock backend configured; proceeding without mutual exclusion. \
             Ensure only one recompute runs at a time."
        );
        Ok(Some(LockHandle::new(scope)))
    }

    async fn release(&self, _handle: &LockHandle) -> Result<()> {
        Ok(())
    }

    async fn renew(&self, _handle: &LockHandle, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }
}

/// A held recompute lock as seen by the locked body.
///
/// A background heartbeat renews the lease every third of its TTL. If a
/// renewal finds the lease taken by another owner, [`Lease::is_lost`] turns
/// true and stays true.
#[derive(Debug, Clone)]
pub struct Lease {
    lost: CancellationToken,
}

impl Lease {
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }
}

/// Bounded-wait wrapper around a [`LockBackend`].
#[derive(Clone)]
pub struct RecomputeLock {
    backend: Arc<dyn LockBackend>,
    acquire_timeout: Duration,
    retry_interval: Duration,
    ttl: Duration,
}

impl RecomputeLock {
    pub fn new(backend: Arc<dyn LockBackend>, acquire_timeout: Duration, ttl: Duration) -> Self {
        Self {
            backend,
            acquire_timeout,
            retry_interval: Duration::from_millis(250),
            ttl,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Retry until acquired or `acquire_timeout` has elapsed.
    pub async fn acquire(&self, scope: &str) -> CoreResult<LockHandle> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            match self.backend.acquire(scope, self.ttl).await {
                Ok(Some(handle)) => {
                    debug!(scope, backend = self.backend.kind(), "Recompute lock acquired");
                    return Ok(handle);
                }
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoreError::LockUnavailable {
                            scope: scope.to_string(),
                        });
                    }
                    tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
                }
                Err(e) => return Err(CoreError::StoreUnavailable(e)),
            }
        }
    }

    /// Run `body` while holding the lock for `scope`.
    ///
    /// `body` only runs if the lock was acquired. The lease is renewed in the
    /// background while `body` runs and released whether `body` succeeds or
    /// fails; a failed release is logged and the lease is left to expire.
    pub async fn with_lock<T, F, Fut>(&self, scope: &str, body: F) -> CoreResult<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let handle = self.acquire(scope).await?;
        let lease = Lease {
            lost: CancellationToken::new(),
        };
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&self.backend),
            handle.clone(),
            self.ttl,
            lease.lost.clone(),
        ));

        let result = body(lease).await;

        heartbeat.abort();
        if let Err(e) = self.backend.release(&handle).await {
            warn!(scope, error = %e, "Failed to release recompute lock; lease will expire");
        }
        result
    }
}

async fn heartbeat(
    backend: Arc<dyn LockBackend>,
    handle: LockHandle,
    ttl: Duration,
    lost: CancellationToken,
) {
    let every = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(every).await;
        match backend.renew(&handle, ttl).await {
            Ok(true) => debug!(scope = %handle.scope, "Recompute lease renewed"),
            Ok(false) => {
                warn!(scope = %handle.scope, "Recompute lease lost to another owner");
                lost.cancel();
                return;
            }
            // Transient: the lease is still ours until it expires.
            Err(e) => warn!(scope = %handle.scope, error = %e, "Failed to renew recompute lease"),
        }
    }
}
