// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Target system ports.
//!
//! A target system is the external system a change mutates. The engine
//! only cares about its declared transactional capability and, for
//! transactional targets, how to demarcate a transaction and manage the
//! applied-marker used by crash recovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::audit::AuditTxType;
use crate::change::ChangeDescriptor;
use crate::error::{EngineError, Result};

/// Declared transactional capability of a target system. Decided once
/// per target, immutable for the life of every change addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxCapability {
    /// No atomic rollback; failures leave partial effects.
    None,
    /// Target transactions exist but the audit ledger is a different store.
    SeparateStore,
    /// Target and audit ledger share one transactional resource.
    SharedStore,
}

impl TxCapability {
    /// The audit tx-type recorded for changes run under this capability.
    pub fn audit_tx_type(&self) -> AuditTxType {
        match self {
            Self::None => AuditTxType::NonTx,
            Self::SeparateStore => AuditTxType::SeparateTx,
            Self::SharedStore => AuditTxType::SharedTx,
        }
    }
}

/// External system a change mutates.
pub trait TargetSystem: Send + Sync {
    /// Unique target system id, referenced by change descriptors.
    fn id(&self) -> &str;

    /// Declared transactional capability.
    fn capability(&self) -> TxCapability;

    /// Downcast to the transactional extension, when capable.
    fn as_transactional(&self) -> Option<&dyn TransactionalTarget> {
        None
    }
}

/// Transaction demarcation and applied-marker operations for targets
/// whose capability is [`TxCapability::SeparateStore`] or
/// [`TxCapability::SharedStore`].
#[async_trait]
pub trait TransactionalTarget: TargetSystem {
    /// Run `work` inside one native transaction: commit when it returns
    /// `Ok`, roll back when it returns `Err`. Returns the work's result,
    /// or a store error if the transaction itself failed.
    async fn run_in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, anyhow::Result<()>>,
    ) -> anyhow::Result<()>;

    /// Set the in-target applied-marker for a change. The marker makes a
    /// crash between commit and audit confirmation visible to recovery.
    async fn mark_applied(&self, task: &ChangeDescriptor) -> Result<()>;

    /// Clear the applied-marker once the audit ledger confirms the change.
    async fn clear_mark(&self, change_id: &str) -> Result<()>;

    /// Whether the applied-marker is currently present for a change.
    async fn is_marked_applied(&self, change_id: &str) -> Result<bool>;
}

/// Registry of target systems, keyed by id, built once at startup.
#[derive(Default, Clone)]
pub struct TargetRegistry {
    targets: BTreeMap<String, Arc<dyn TargetSystem>>,
}

impl TargetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target system, replacing any previous one with the
    /// same id.
    pub fn register(&mut self, target: Arc<dyn TargetSystem>) {
        self.targets.insert(target.id().to_string(), target);
    }

    /// Resolve a target system id.
    pub fn resolve(&self, target_system_id: &str) -> Result<Arc<dyn TargetSystem>> {
        self.targets
            .get(target_system_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTargetSystem {
                target_system_id: target_system_id.to_string(),
            })
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no targets are registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("ids", &self.targets.keys().collect::<Vec<_>>())
            .finish()
    }
}
