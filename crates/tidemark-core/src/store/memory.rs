// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory audit ledger and lock store.
//!
//! Backs unit tests and embedded single-process usage. The lock store
//! performs its read-check-write sequence under one mutex guard, which
//! stands in for the store-native transaction a persistent backend uses.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::audit::{AuditEntry, AuditLedger, AuditSnapshot, snapshot_from_history};
use crate::error::{EngineError, Result};
use crate::lock::{LOCK_HELD, LockAcquisition, LockEntry, LockKey, LockStore, RunnerId};

/// Append-only in-memory audit ledger.
#[derive(Default)]
pub struct InMemoryAuditLedger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries for one change, in insertion order.
    pub fn entries_for(&self, change_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .expect("ledger poisoned")
            .iter()
            .filter(|e| e.change_id == change_id)
            .cloned()
            .collect()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("ledger poisoned").len()
    }

    /// True when the ledger holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditLedger for InMemoryAuditLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .expect("ledger poisoned")
            .push(entry.clone());
        Ok(())
    }

    async fn snapshot(&self) -> Result<AuditSnapshot> {
        let history = self.entries.lock().expect("ledger poisoned").clone();
        Ok(snapshot_from_history(history))
    }

    async fn history(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.lock().expect("ledger poisoned").clone())
    }
}

/// In-memory lease-record store with compare-and-set acquire semantics.
#[derive(Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockStore {
    /// Create an empty lock store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn upsert(
        &self,
        key: &LockKey,
        owner: &RunnerId,
        lease_millis: u64,
    ) -> Result<LockAcquisition> {
        let mut locks = self.locks.lock().expect("lock store poisoned");
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds(lease_millis as i64);

        if let Some(existing) = locks.get(key.as_str())
            && existing.owner != owner.as_str()
            && existing.expires_at > now
        {
            return Err(EngineError::LockHeldByOther {
                key: key.as_str().to_string(),
                owner: existing.owner.clone(),
                until: existing.expires_at,
            });
        }

        locks.insert(
            key.as_str().to_string(),
            LockEntry {
                key: key.as_str().to_string(),
                owner: owner.as_str().to_string(),
                status: LOCK_HELD.to_string(),
                expires_at,
            },
        );

        Ok(LockAcquisition {
            owner: owner.clone(),
            acquired_for_millis: lease_millis,
            expires_at,
        })
    }

    async fn extend(
        &self,
        key: &LockKey,
        owner: &RunnerId,
        lease_millis: u64,
    ) -> Result<LockAcquisition> {
        let mut locks = self.locks.lock().expect("lock store poisoned");

        match locks.get_mut(key.as_str()) {
            Some(existing) if existing.owner == owner.as_str() => {
                let expires_at = Utc::now() + Duration::milliseconds(lease_millis as i64);
                existing.expires_at = expires_at;
                Ok(LockAcquisition {
                    owner: owner.clone(),
                    acquired_for_millis: lease_millis,
                    expires_at,
                })
            }
            _ => Err(EngineError::LockNotOwned {
                key: key.as_str().to_string(),
                owner: owner.as_str().to_string(),
            }),
        }
    }

    async fn read(&self, key: &LockKey) -> Result<Option<LockEntry>> {
        Ok(self
            .locks
            .lock()
            .expect("lock store poisoned")
            .get(key.as_str())
            .cloned())
    }

    async fn delete(&self, key: &LockKey, owner: &RunnerId) -> Result<()> {
        let mut locks = self.locks.lock().expect("lock store poisoned");
        if let Some(existing) = locks.get(key.as_str())
            && existing.owner == owner.as_str()
        {
            locks.remove(key.as_str());
        }
        Ok(())
    }
}
