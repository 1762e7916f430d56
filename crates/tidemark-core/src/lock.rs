// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed lease lock.
//!
//! Mutual exclusion between runner instances is a single lease record
//! per lock key. The [`LockStore`] port supplies atomic conditional
//! writes; the [`LockManager`] supplies lease timing and ownership
//! semantics on top. Holding the lock is the sole admission gate for
//! executing changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::runner_hostname;
use crate::error::{EngineError, Result};

/// Status string stored for a held lease.
pub const LOCK_HELD: &str = "LOCK_HELD";

/// Opaque identifier of one runner instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerId(String);

impl RunnerId {
    /// Generate a fresh runner id from hostname and a random suffix.
    pub fn generate() -> Self {
        Self(format!("{}-{}", runner_hostname(), uuid::Uuid::new_v4()))
    }

    /// Wrap an existing identifier.
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of one distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Wrap a lock name.
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockKey {
    fn default() -> Self {
        Self("tidemark-lock".to_string())
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted lease record, one per lock key.
#[derive(Debug, Clone)]
pub struct LockEntry {
    /// The lock key.
    pub key: String,
    /// Current owner.
    pub owner: String,
    /// Lease status; always [`LOCK_HELD`] while the record exists.
    pub status: String,
    /// When the lease expires and ownership may transfer.
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful acquire or extend.
#[derive(Debug, Clone)]
pub struct LockAcquisition {
    /// The owner holding the lease.
    pub owner: RunnerId,
    /// Lease duration granted, in milliseconds.
    pub acquired_for_millis: u64,
    /// Absolute expiry of the lease.
    pub expires_at: DateTime<Utc>,
}

/// Persisted lease-record port.
///
/// Backends must make every read-modify-write sequence atomic (native
/// transaction or conditional upsert) so that two racing runners never
/// both acquire; the loser surfaces [`EngineError::LockHeldByOther`].
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Acquire or refresh the lease. Succeeds when no entry exists, the
    /// caller already owns it, or the existing lease has expired.
    async fn upsert(
        &self,
        key: &LockKey,
        owner: &RunnerId,
        lease_millis: u64,
    ) -> Result<LockAcquisition>;

    /// Extend the lease; only valid for the current owner.
    async fn extend(
        &self,
        key: &LockKey,
        owner: &RunnerId,
        lease_millis: u64,
    ) -> Result<LockAcquisition>;

    /// Read the current lease record, if any.
    async fn read(&self, key: &LockKey) -> Result<Option<LockEntry>>;

    /// Delete the lease if owned by `owner`; no-op otherwise.
    async fn delete(&self, key: &LockKey, owner: &RunnerId) -> Result<()>;
}

/// Lease timing knobs for one lock manager.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration granted on each acquire/extend, in milliseconds.
    pub lease_millis: u64,
    /// Total budget for the acquire retry loop, in milliseconds.
    pub quit_trying_after_millis: u64,
    /// Pause between acquire retries, in milliseconds.
    pub retry_frequency_millis: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease_millis: 60_000,
            quit_trying_after_millis: 180_000,
            retry_frequency_millis: 1_000,
        }
    }
}

/// Acquires, extends and releases the lease on top of a [`LockStore`].
///
/// The only component aware of lease timing and ownership semantics.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    owner: RunnerId,
    key: LockKey,
    options: LockOptions,
}

impl LockManager {
    /// Create a manager for one runner and one lock key.
    pub fn new(
        store: Arc<dyn LockStore>,
        owner: RunnerId,
        key: LockKey,
        options: LockOptions,
    ) -> Self {
        Self {
            store,
            owner,
            key,
            options,
        }
    }

    /// The runner this manager acquires for.
    pub fn owner(&self) -> &RunnerId {
        &self.owner
    }

    /// Acquire the lease, retrying on contention until the configured
    /// budget is exhausted.
    pub async fn acquire(&self) -> Result<LockLease> {
        let started = tokio::time::Instant::now();
        let deadline = started + Duration::from_millis(self.options.quit_trying_after_millis);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            info!(
                key = %self.key,
                timeout_millis = self.options.quit_trying_after_millis,
                "Attempting to acquire process lock"
            );
            match self
                .store
                .upsert(&self.key, &self.owner, self.options.lease_millis)
                .await
            {
                Ok(acquisition) => {
                    info!(
                        key = %self.key,
                        lease_millis = acquisition.acquired_for_millis,
                        expires_at = %acquisition.expires_at,
                        "Process lock acquired"
                    );
                    return Ok(LockLease::new(
                        self.store.clone(),
                        self.key.clone(),
                        self.owner.clone(),
                        self.options.lease_millis,
                        acquisition.expires_at,
                    ));
                }
                Err(err @ EngineError::LockHeldByOther { .. }) => {
                    let retry = Duration::from_millis(self.options.retry_frequency_millis);
                    if tokio::time::Instant::now() + retry > deadline {
                        if attempts == 1 {
                            // No retry budget; surface who holds the lock.
                            return Err(err);
                        }
                        return Err(EngineError::LockAcquisitionTimedOut {
                            key: self.key.as_str().to_string(),
                            tried_for_millis: started.elapsed().as_millis() as u64,
                        });
                    }
                    debug!(key = %self.key, error = %err, "Lock busy, retrying");
                    tokio::time::sleep(retry).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("options", &self.options)
            .finish()
    }
}

/// A held lease. Extend it during long executions; release it when the
/// run finishes.
#[derive(Clone)]
pub struct LockLease {
    store: Arc<dyn LockStore>,
    key: LockKey,
    owner: RunnerId,
    lease_millis: u64,
    expires_at: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl LockLease {
    fn new(
        store: Arc<dyn LockStore>,
        key: LockKey,
        owner: RunnerId,
        lease_millis: u64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            key,
            owner,
            lease_millis,
            expires_at: Arc::new(std::sync::Mutex::new(expires_at)),
        }
    }

    /// The owner of this lease.
    pub fn owner(&self) -> &RunnerId {
        &self.owner
    }

    /// The lock key of this lease.
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Current expiry of the lease.
    pub fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.lock().expect("lease expiry poisoned")
    }

    /// Extend the lease by the configured duration. Fails if another
    /// runner took the lock over after expiry.
    pub async fn extend(&self) -> Result<()> {
        let acquisition = self
            .store
            .extend(&self.key, &self.owner, self.lease_millis)
            .await?;
        *self.expires_at.lock().expect("lease expiry poisoned") = acquisition.expires_at;
        debug!(key = %self.key, expires_at = %acquisition.expires_at, "Lease extended");
        Ok(())
    }

    /// Best-effort release. A missing or foreign record is a no-op;
    /// store failures are logged, not surfaced.
    pub async fn release(&self) {
        if let Err(err) = self.store.delete(&self.key, &self.owner).await {
            warn!(key = %self.key, error = %err, "Lock release failed (ignored)");
        } else {
            info!(key = %self.key, "Process lock released");
        }
    }

    /// Spawn a background task extending the lease at `frequency` until
    /// the returned refresher is stopped.
    pub fn spawn_refresher(&self, frequency: Duration) -> LockRefresher {
        let lease = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = tokio::time::sleep(frequency) => {
                        if let Err(err) = lease.extend().await {
                            warn!(key = %lease.key, error = %err, "Lease refresh failed");
                            break;
                        }
                    }
                }
            }
            debug!(key = %lease.key, "Lease refresher stopped");
        });

        LockRefresher {
            handle,
            shutdown_tx,
        }
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// Handle to a running lease-refresh task.
pub struct LockRefresher {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl LockRefresher {
    /// Stop the refresh task and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}
