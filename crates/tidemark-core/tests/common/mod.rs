// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tidemark-core integration tests.
//!
//! Provides recording change steps, mock target systems for all three
//! transactional capabilities, and helpers to assemble a runner over the
//! in-memory backends.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;

use tidemark_core::audit::{AuditEntry, AuditLedger, AuditSnapshot, AuditStatus};
use tidemark_core::change::{ChangeDefinition, ChangeDescriptor, ChangeRegistry, ChangeStep};
use tidemark_core::error::Result;
use tidemark_core::executor::{PipelineRunner, RunnerOptions, StageExecutor};
use tidemark_core::lock::{LockKey, LockManager, LockOptions, RunnerId};
use tidemark_core::planner::ExecutionPlanner;
use tidemark_core::store::memory::{InMemoryAuditLedger, InMemoryLockStore};
use tidemark_core::target::{TargetRegistry, TargetSystem, TransactionalTarget, TxCapability};

/// Shared journal recording every apply and rollback invocation.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// A change step that records its invocations in a shared journal.
pub struct RecordingStep {
    name: String,
    journal: Journal,
    fail_apply: bool,
    rollback: bool,
    fail_rollback: bool,
}

impl RecordingStep {
    pub fn new(name: &str, journal: Journal) -> Self {
        Self {
            name: name.to_string(),
            journal,
            fail_apply: false,
            rollback: false,
            fail_rollback: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    pub fn with_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.rollback = true;
        self.fail_rollback = true;
        self
    }
}

#[async_trait]
impl ChangeStep for RecordingStep {
    async fn apply(&self) -> anyhow::Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("apply:{}", self.name));
        if self.fail_apply {
            anyhow::bail!("step '{}' failed", self.name);
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("rollback:{}", self.name));
        if self.fail_rollback {
            anyhow::bail!("rollback of '{}' failed", self.name);
        }
        Ok(())
    }

    fn has_rollback(&self) -> bool {
        self.rollback
    }

    fn origin(&self) -> String {
        format!("test::{}", self.name)
    }
}

/// Target system without transactional support.
pub struct PlainTarget {
    id: String,
}

impl PlainTarget {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl TargetSystem for PlainTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> TxCapability {
        TxCapability::None
    }
}

/// Target system with its own transactions, audited in a separate store.
/// Tracks applied-markers; transactions run the work and report its
/// result (the steps' own effects are observed through the journal).
pub struct SeparateTxTarget {
    id: String,
    markers: Mutex<HashSet<String>>,
}

impl SeparateTxTarget {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            markers: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_marker(&self, change_id: &str) {
        self.markers.lock().unwrap().insert(change_id.to_string());
    }

    pub fn has_marker(&self, change_id: &str) -> bool {
        self.markers.lock().unwrap().contains(change_id)
    }
}

impl TargetSystem for SeparateTxTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> TxCapability {
        TxCapability::SeparateStore
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalTarget> {
        Some(self)
    }
}

#[async_trait]
impl TransactionalTarget for SeparateTxTarget {
    async fn run_in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        work.await
    }

    async fn mark_applied(&self, task: &ChangeDescriptor) -> Result<()> {
        self.set_marker(&task.id);
        Ok(())
    }

    async fn clear_mark(&self, change_id: &str) -> Result<()> {
        self.markers.lock().unwrap().remove(change_id);
        Ok(())
    }

    async fn is_marked_applied(&self, change_id: &str) -> Result<bool> {
        Ok(self.has_marker(change_id))
    }
}

/// Audit ledger whose appends can be staged inside a transaction and
/// discarded on abort, modelling a ledger sharing the target's store.
#[derive(Default)]
pub struct TxStagingLedger {
    inner: InMemoryAuditLedger,
    staging: Mutex<Option<Vec<AuditEntry>>>,
}

impl TxStagingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) {
        *self.staging.lock().unwrap() = Some(Vec::new());
    }

    async fn commit(&self) -> Result<()> {
        let staged = self.staging.lock().unwrap().take().unwrap_or_default();
        for entry in staged {
            self.inner.append(&entry).await?;
        }
        Ok(())
    }

    fn abort(&self) {
        *self.staging.lock().unwrap() = None;
    }
}

#[async_trait]
impl AuditLedger for TxStagingLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        // Guard scope must close before awaiting the inner append.
        let staged = {
            let mut staging = self.staging.lock().unwrap();
            match staging.as_mut() {
                Some(staged) => {
                    staged.push(entry.clone());
                    true
                }
                None => false,
            }
        };
        if staged {
            Ok(())
        } else {
            self.inner.append(entry).await
        }
    }

    async fn snapshot(&self) -> Result<AuditSnapshot> {
        self.inner.snapshot().await
    }

    async fn history(&self) -> Result<Vec<AuditEntry>> {
        self.inner.history().await
    }
}

/// Target system sharing one transactional resource with the ledger.
pub struct SharedTxTarget {
    id: String,
    ledger: Arc<TxStagingLedger>,
    markers: Mutex<HashSet<String>>,
}

impl SharedTxTarget {
    pub fn new(id: &str, ledger: Arc<TxStagingLedger>) -> Self {
        Self {
            id: id.to_string(),
            ledger,
            markers: Mutex::new(HashSet::new()),
        }
    }
}

impl TargetSystem for SharedTxTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> TxCapability {
        TxCapability::SharedStore
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalTarget> {
        Some(self)
    }
}

#[async_trait]
impl TransactionalTarget for SharedTxTarget {
    async fn run_in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        self.ledger.begin();
        match work.await {
            Ok(()) => {
                self.ledger.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            Err(err) => {
                self.ledger.abort();
                Err(err)
            }
        }
    }

    async fn mark_applied(&self, task: &ChangeDescriptor) -> Result<()> {
        self.markers.lock().unwrap().insert(task.id.clone());
        Ok(())
    }

    async fn clear_mark(&self, change_id: &str) -> Result<()> {
        self.markers.lock().unwrap().remove(change_id);
        Ok(())
    }

    async fn is_marked_applied(&self, change_id: &str) -> Result<bool> {
        Ok(self.markers.lock().unwrap().contains(change_id))
    }
}

/// Build a single-step definition for a non-transactional target.
pub fn definition(id: &str, order: &str, target_id: &str, step: RecordingStep) -> ChangeDefinition {
    ChangeDefinition::new(
        ChangeDescriptor::new(id, "tester", order, target_id),
        Arc::new(step),
    )
}

/// The ledger states recorded for one change, in insertion order.
pub async fn states_for(ledger: &Arc<dyn AuditLedger>, change_id: &str) -> Vec<AuditStatus> {
    ledger
        .history()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.change_id == change_id)
        .map(|e| e.state)
        .collect()
}

/// Lock options that give up quickly, for contention tests.
pub fn fast_lock_options() -> LockOptions {
    LockOptions {
        lease_millis: 60_000,
        quit_trying_after_millis: 0,
        retry_frequency_millis: 10,
    }
}

/// Assemble a runner over in-memory backends.
pub fn runner(
    ledger: Arc<dyn AuditLedger>,
    lock_store: Arc<InMemoryLockStore>,
    registry: ChangeRegistry,
    targets: TargetRegistry,
    options: RunnerOptions,
) -> PipelineRunner {
    let planner = ExecutionPlanner::new(ledger.clone(), registry, targets.clone());
    let lock = LockManager::new(
        lock_store,
        RunnerId::generate(),
        LockKey::default(),
        LockOptions::default(),
    );
    PipelineRunner::new(planner, lock, StageExecutor::new(targets), ledger, options)
}
