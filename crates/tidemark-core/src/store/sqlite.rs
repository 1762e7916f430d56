// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed audit ledger and lock store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::audit::{
    AuditEntry, AuditLedger, AuditSnapshot, AuditStatus, AuditTxType, ExecutionKind,
    RecoveryStrategy, snapshot_from_history,
};
use crate::error::{EngineError, Result};
use crate::lock::{LOCK_HELD, LockAcquisition, LockEntry, LockKey, LockStore, RunnerId};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Shared SQLite pool behind both the audit ledger and the lock store.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a backend from an existing pool. Migrations are assumed
    /// to have run already.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a backend from a file path.
    ///
    /// Creates parent directories and the database file as needed,
    /// connects, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::StoreError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| EngineError::StoreError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::StoreError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// An audit ledger over this backend.
    pub fn audit_ledger(&self) -> SqliteAuditLedger {
        SqliteAuditLedger {
            pool: self.pool.clone(),
        }
    }

    /// A lock store over this backend.
    pub fn lock_store(&self) -> SqliteLockStore {
        SqliteLockStore {
            pool: self.pool.clone(),
        }
    }
}

/// SQLite-backed append-only audit ledger.
#[derive(Clone)]
pub struct SqliteAuditLedger {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    execution_id: String,
    stage_id: String,
    change_id: String,
    author: String,
    created_at: DateTime<Utc>,
    state: String,
    kind: String,
    origin: String,
    metadata: String,
    execution_millis: i64,
    execution_hostname: String,
    error_trace: Option<String>,
    tx_type: Option<String>,
    target_system_id: String,
    order_key: String,
    recovery: String,
    system_change: bool,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry> {
        Ok(AuditEntry {
            execution_id: self.execution_id,
            stage_id: self.stage_id,
            change_id: self.change_id,
            author: self.author,
            created_at: self.created_at,
            state: AuditStatus::parse(&self.state),
            kind: ExecutionKind::parse(&self.kind),
            origin: self.origin,
            metadata: serde_json::from_str(&self.metadata)?,
            execution_millis: self.execution_millis,
            execution_hostname: self.execution_hostname,
            error_trace: self.error_trace,
            tx_type: self.tx_type.as_deref().and_then(AuditTxType::parse),
            target_system_id: self.target_system_id,
            order: self.order_key,
            recovery: RecoveryStrategy::parse(&self.recovery),
            system_change: self.system_change,
        })
    }
}

const AUDIT_COLUMNS: &str = "execution_id, stage_id, change_id, author, created_at, state, \
     kind, origin, metadata, execution_millis, execution_hostname, error_trace, tx_type, \
     target_system_id, order_key, recovery, system_change";

#[async_trait]
impl AuditLedger for SqliteAuditLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (execution_id, stage_id, change_id, author, created_at,
                state, kind, origin, metadata, execution_millis, execution_hostname,
                error_trace, tx_type, target_system_id, order_key, recovery, system_change)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.execution_id)
        .bind(&entry.stage_id)
        .bind(&entry.change_id)
        .bind(&entry.author)
        .bind(entry.created_at)
        .bind(entry.state.as_str())
        .bind(entry.kind.as_str())
        .bind(&entry.origin)
        .bind(entry.metadata.to_string())
        .bind(entry.execution_millis)
        .bind(&entry.execution_hostname)
        .bind(&entry.error_trace)
        .bind(entry.tx_type.map(|t| t.as_str()))
        .bind(&entry.target_system_id)
        .bind(&entry.order)
        .bind(entry.recovery.as_str())
        .bind(entry.system_change)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn snapshot(&self) -> Result<AuditSnapshot> {
        Ok(snapshot_from_history(self.history().await?))
    }

    async fn history(&self) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log ORDER BY id",
            AUDIT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_entry).collect()
    }
}

/// SQLite-backed lease-record store.
///
/// Acquire is one conditional upsert, so the read-check-write sequence
/// is atomic within the store regardless of competing runners.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct LockRow {
    lock_key: String,
    owner: String,
    status: String,
    expires_at: DateTime<Utc>,
}

impl LockRow {
    fn into_entry(self) -> LockEntry {
        LockEntry {
            key: self.lock_key,
            owner: self.owner,
            status: self.status,
            expires_at: self.expires_at,
        }
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn upsert(
        &self,
        key: &LockKey,
        owner: &RunnerId,
        lease_millis: u64,
    ) -> Result<LockAcquisition> {
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds(lease_millis as i64);

        let result = sqlx::query(
            r#"
            INSERT INTO runner_lock (lock_key, owner, status, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE
                SET owner = excluded.owner, expires_at = excluded.expires_at
                WHERE runner_lock.owner = excluded.owner
                   OR runner_lock.expires_at <= ?
            "#,
        )
        .bind(key.as_str())
        .bind(owner.as_str())
        .bind(LOCK_HELD)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let holder = self.read(key).await?;
            let (holder_owner, until) = holder
                .map(|h| (h.owner, h.expires_at))
                .unwrap_or_else(|| ("unknown".to_string(), now));
            return Err(EngineError::LockHeldByOther {
                key: key.as_str().to_string(),
                owner: holder_owner,
                until,
            });
        }

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
        let expires_at = Utc::now() + Duration::milliseconds(lease_millis as i64);

        let result = sqlx::query(
            "UPDATE runner_lock SET expires_at = ? WHERE lock_key = ? AND owner = ?",
        )
        .bind(expires_at)
        .bind(key.as_str())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::LockNotOwned {
                key: key.as_str().to_string(),
                owner: owner.as_str().to_string(),
            });
        }

        Ok(LockAcquisition {
            owner: owner.clone(),
            acquired_for_millis: lease_millis,
            expires_at,
        })
    }

    async fn read(&self, key: &LockKey) -> Result<Option<LockEntry>> {
        let row = sqlx::query_as::<_, LockRow>(
            "SELECT lock_key, owner, status, expires_at FROM runner_lock WHERE lock_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LockRow::into_entry))
    }

    async fn delete(&self, key: &LockKey, owner: &RunnerId) -> Result<()> {
        sqlx::query("DELETE FROM runner_lock WHERE lock_key = ? AND owner = ?")
            .bind(key.as_str())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
