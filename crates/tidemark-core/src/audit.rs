// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit ledger model and port.
//!
//! The audit ledger is an append-only record of every change attempt.
//! One entry is written per (execution, change, attempt-state) pair; the
//! current status of a change is derived by taking its most recent entry.
//! Entries are never mutated or deleted - operator fixes append new
//! terminal entries on top.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::change::ChangeDescriptor;
use crate::error::{EngineError, Result};

/// Status of one audit entry.
///
/// `Started` is the initial state of every attempt. `Executed`,
/// `RolledBack`, `RollbackFailed` and the two operator-fix states are
/// terminal. `ExecutionFailed` may be followed by a rollback outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    /// Attempt began; no terminal entry yet means it was interrupted.
    Started,
    /// Change applied and confirmed.
    Executed,
    /// Change body failed.
    ExecutionFailed,
    /// Change undone (automatically by a transaction or manually).
    RolledBack,
    /// A rollback step failed; target state is unknown.
    RollbackFailed,
    /// Operator fixed the change by marking it applied.
    MarkedAppliedByOperator,
    /// Operator fixed the change by marking it rolled back.
    MarkedRolledBackByOperator,
    /// Unrecognized status read from a store written by a newer version.
    Unknown,
}

impl AuditStatus {
    /// Returns the string representation persisted in stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Executed => "EXECUTED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::MarkedAppliedByOperator => "MANUAL_MARKED_AS_APPLIED",
            Self::MarkedRolledBackByOperator => "MANUAL_MARKED_AS_ROLLED_BACK",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a status from its stored string. Unrecognized values map to
    /// [`AuditStatus::Unknown`] so the recovery matrix can fail safe.
    pub fn parse(s: &str) -> Self {
        match s {
            "STARTED" => Self::Started,
            "EXECUTED" => Self::Executed,
            "EXECUTION_FAILED" => Self::ExecutionFailed,
            "ROLLED_BACK" => Self::RolledBack,
            "ROLLBACK_FAILED" => Self::RollbackFailed,
            "MANUAL_MARKED_AS_APPLIED" => Self::MarkedAppliedByOperator,
            "MANUAL_MARKED_AS_ROLLED_BACK" => Self::MarkedRolledBackByOperator,
            _ => Self::Unknown,
        }
    }

    /// Relevance rank used to break ties between entries sharing a
    /// timestamp: a rollback outcome is more informative than the
    /// execution outcome it follows, which is more informative than the
    /// start entry it follows.
    pub fn relevance(&self) -> u8 {
        match self {
            Self::RollbackFailed => 6,
            Self::RolledBack => 5,
            Self::MarkedAppliedByOperator | Self::MarkedRolledBackByOperator => 4,
            Self::ExecutionFailed => 3,
            Self::Executed => 2,
            Self::Started => 1,
            Self::Unknown => 0,
        }
    }
}

/// Kind of operation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    /// The change body itself.
    Execution,
    /// A compensating rollback step.
    Rollback,
}

impl ExecutionKind {
    /// Returns the string representation persisted in stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "EXECUTION",
            Self::Rollback => "ROLLBACK",
        }
    }

    /// Parse from the stored string, defaulting to `Execution`.
    pub fn parse(s: &str) -> Self {
        match s {
            "ROLLBACK" => Self::Rollback,
            _ => Self::Execution,
        }
    }
}

/// Transactional regime a change was executed under, recorded for the
/// recovery decision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTxType {
    /// No native transaction; failures leave partial effects.
    NonTx,
    /// Target transaction separate from the audit store.
    SeparateTx,
    /// Target and audit store share one transaction.
    SharedTx,
}

impl AuditTxType {
    /// Returns the string representation persisted in stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonTx => "NON_TX",
            Self::SeparateTx => "TX_SEPARATE",
            Self::SharedTx => "TX_SHARED",
        }
    }

    /// Parse from the stored string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NON_TX" => Some(Self::NonTx),
            "TX_SEPARATE" => Some(Self::SeparateTx),
            "TX_SHARED" => Some(Self::SharedTx),
            _ => None,
        }
    }

    /// True when the target system's own transaction undoes a failed
    /// attempt, making retry safe.
    pub fn is_transactional(&self) -> bool {
        !matches!(self, Self::NonTx)
    }
}

/// How a change wants to be treated when a previous attempt left it in
/// an ambiguous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryStrategy {
    /// Halt and wait for an operator decision (the safe default).
    #[default]
    ManualIntervention,
    /// The change is idempotent enough to always retry automatically.
    AlwaysRetry,
}

impl RecoveryStrategy {
    /// Returns the string representation persisted in stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualIntervention => "MANUAL_INTERVENTION",
            Self::AlwaysRetry => "ALWAYS_RETRY",
        }
    }

    /// Parse from the stored string, defaulting to manual intervention.
    pub fn parse(s: &str) -> Self {
        match s {
            "ALWAYS_RETRY" => Self::AlwaysRetry,
            _ => Self::ManualIntervention,
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Identifier of the run that produced this entry.
    pub execution_id: String,
    /// Stage the change belongs to.
    pub stage_id: String,
    /// The change this entry records an attempt of.
    pub change_id: String,
    /// Declared author of the change.
    pub author: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// Attempt state recorded by this entry.
    pub state: AuditStatus,
    /// Whether this records the change body or a rollback step.
    pub kind: ExecutionKind,
    /// Origin reference (type name of the registered change step).
    pub origin: String,
    /// Opaque key-value metadata attached by the change definition.
    pub metadata: serde_json::Value,
    /// Wall-clock duration of the attempt in milliseconds.
    pub execution_millis: i64,
    /// Hostname of the runner that wrote the entry.
    pub execution_hostname: String,
    /// Error trace for failed attempts.
    pub error_trace: Option<String>,
    /// Transactional regime the attempt ran under.
    pub tx_type: Option<AuditTxType>,
    /// Target system the change mutates.
    pub target_system_id: String,
    /// Declared ordering key, for deterministic replay.
    pub order: String,
    /// Recovery strategy declared by the change.
    pub recovery: RecoveryStrategy,
    /// True for engine-internal changes, false for user changes.
    pub system_change: bool,
}

impl AuditEntry {
    /// Pick the more relevant of two entries for the same change:
    /// the later one, with [`AuditStatus::relevance`] breaking ties.
    pub fn more_relevant(a: AuditEntry, b: AuditEntry) -> AuditEntry {
        if a.created_at != b.created_at {
            if a.created_at > b.created_at { a } else { b }
        } else if a.state.relevance() >= b.state.relevance() {
            a
        } else {
            b
        }
    }
}

/// Latest audit entry per change id.
pub type AuditSnapshot = HashMap<String, AuditEntry>;

/// Build a snapshot from a full history, keeping the most relevant entry
/// per change id.
pub fn snapshot_from_history(history: Vec<AuditEntry>) -> AuditSnapshot {
    let mut snapshot: AuditSnapshot = HashMap::new();
    for entry in history {
        match snapshot.remove(&entry.change_id) {
            Some(existing) => {
                let winner = AuditEntry::more_relevant(existing, entry);
                snapshot.insert(winner.change_id.clone(), winner);
            }
            None => {
                snapshot.insert(entry.change_id.clone(), entry);
            }
        }
    }
    snapshot
}

/// Append/query port over the persisted audit ledger.
///
/// Backends must make `append` durable before returning: the executor
/// relies on "the last entry reflects the true last known state" after
/// a crash.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    /// Append one entry. Entries are never updated or deleted.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Latest entry per change id.
    async fn snapshot(&self) -> Result<AuditSnapshot>;

    /// Full history in insertion order.
    async fn history(&self) -> Result<Vec<AuditEntry>>;
}

/// Context shared by all audit entries of one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Identifier of this run.
    pub execution_id: String,
    /// Hostname of this runner.
    pub hostname: String,
}

impl ExecutionContext {
    /// Create a context with a fresh execution id.
    pub fn new_execution() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            execution_id: format!("{}-{}", now, uuid::Uuid::new_v4()),
            hostname: runner_hostname(),
        }
    }
}

/// Hostname used to stamp audit entries, falling back to "unknown".
pub(crate) fn runner_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Lifecycle writer used by the change process strategies.
///
/// The recorder is the only component that writes to the audit ledger.
/// It stamps every entry with the run context and maps backend failures
/// to [`EngineError::AuditWriteFailed`].
pub struct AuditRecorder {
    ledger: Arc<dyn AuditLedger>,
    context: ExecutionContext,
    stage_id: String,
}

impl AuditRecorder {
    /// Create a recorder for one stage of one run.
    pub fn new(ledger: Arc<dyn AuditLedger>, context: ExecutionContext, stage_id: &str) -> Self {
        Self {
            ledger,
            context,
            stage_id: stage_id.to_string(),
        }
    }

    /// Record the start of an attempt.
    pub async fn record_started(
        &self,
        task: &ChangeDescriptor,
        tx_type: AuditTxType,
    ) -> Result<()> {
        self.append_for(task, tx_type, AuditStatus::Started, ExecutionKind::Execution, 0, None)
            .await
    }

    /// Record a successful execution.
    pub async fn record_executed(
        &self,
        task: &ChangeDescriptor,
        tx_type: AuditTxType,
        execution_millis: i64,
    ) -> Result<()> {
        self.append_for(
            task,
            tx_type,
            AuditStatus::Executed,
            ExecutionKind::Execution,
            execution_millis,
            None,
        )
        .await
    }

    /// Record an execution failure.
    pub async fn record_execution_failed(
        &self,
        task: &ChangeDescriptor,
        tx_type: AuditTxType,
        execution_millis: i64,
        error_trace: &str,
    ) -> Result<()> {
        self.append_for(
            task,
            tx_type,
            AuditStatus::ExecutionFailed,
            ExecutionKind::Execution,
            execution_millis,
            Some(error_trace.to_string()),
        )
        .await
    }

    /// Record an automatic rollback performed by the target system's own
    /// transaction.
    pub async fn record_auto_rolled_back(
        &self,
        task: &ChangeDescriptor,
        tx_type: AuditTxType,
    ) -> Result<()> {
        self.append_for(task, tx_type, AuditStatus::RolledBack, ExecutionKind::Rollback, 0, None)
            .await
    }

    /// Record the outcome of one manual (compensating) rollback step.
    pub async fn record_manual_rollback(
        &self,
        task: &ChangeDescriptor,
        tx_type: AuditTxType,
        execution_millis: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let state = if error.is_none() {
            AuditStatus::RolledBack
        } else {
            AuditStatus::RollbackFailed
        };
        self.append_for(
            task,
            tx_type,
            state,
            ExecutionKind::Rollback,
            execution_millis,
            error.map(str::to_string),
        )
        .await
    }

    async fn append_for(
        &self,
        task: &ChangeDescriptor,
        tx_type: AuditTxType,
        state: AuditStatus,
        kind: ExecutionKind,
        execution_millis: i64,
        error_trace: Option<String>,
    ) -> Result<()> {
        let entry = AuditEntry {
            execution_id: self.context.execution_id.clone(),
            stage_id: self.stage_id.clone(),
            change_id: task.id.clone(),
            author: task.author.clone(),
            created_at: Utc::now(),
            state,
            kind,
            origin: task.origin.clone(),
            metadata: task.metadata.clone(),
            execution_millis,
            execution_hostname: self.context.hostname.clone(),
            error_trace,
            tx_type: Some(tx_type),
            target_system_id: task.target_system_id.clone(),
            order: task.order.clone(),
            recovery: task.recovery,
            system_change: task.system_change,
        };

        match self.ledger.append(&entry).await {
            Ok(()) => {
                debug!(
                    change_id = %task.id,
                    state = state.as_str(),
                    "Audit entry appended"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    change_id = %task.id,
                    state = state.as_str(),
                    error = %err,
                    "Audit append failed"
                );
                Err(EngineError::AuditWriteFailed {
                    change_id: task.id.clone(),
                    details: err.to_string(),
                })
            }
        }
    }
}
