// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit-sequence tests for the three change process strategies.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tidemark_core::audit::{
    AuditEntry, AuditLedger, AuditRecorder, AuditSnapshot, AuditStatus, ExecutionContext,
};
use tidemark_core::change::{ChangeDefinition, ChangeDescriptor};
use tidemark_core::error::Result;
use tidemark_core::store::memory::InMemoryAuditLedger;
use tidemark_core::strategy::execute_change;
use tidemark_core::target::TargetSystem;

use common::{
    Journal, PlainTarget, RecordingStep, SeparateTxTarget, SharedTxTarget, TxStagingLedger,
    states_for,
};

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn recorder(ledger: &Arc<dyn AuditLedger>) -> AuditRecorder {
    AuditRecorder::new(ledger.clone(), ExecutionContext::new_execution(), "stage-1")
}

fn three_step_definition(target_id: &str, journal: &Journal) -> ChangeDefinition {
    ChangeDefinition::new(
        ChangeDescriptor::new("c1", "tester", "0001", target_id),
        Arc::new(RecordingStep::new("s1", journal.clone()).with_rollback()),
    )
    .with_step(Arc::new(
        RecordingStep::new("s2", journal.clone()).with_rollback(),
    ))
    .with_step(Arc::new(RecordingStep::new("s3", journal.clone()).failing()))
}

#[tokio::test]
async fn test_non_tx_success_audits_started_then_executed() {
    let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
    let journal = journal();
    let definition = common::definition("c1", "0001", "db", RecordingStep::new("s1", journal));
    let target: Arc<dyn TargetSystem> = Arc::new(PlainTarget::new("db"));

    let result = execute_change(&recorder(&ledger), &definition, target)
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![AuditStatus::Started, AuditStatus::Executed]
    );
}

#[tokio::test]
async fn test_non_tx_failure_replays_rollback_chain_in_reverse() {
    let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
    let journal = journal();
    let definition = three_step_definition("db", &journal);
    let target: Arc<dyn TargetSystem> = Arc::new(PlainTarget::new("db"));

    let result = execute_change(&recorder(&ledger), &definition, target)
        .await
        .unwrap();

    assert!(!result.succeeded());
    // Both applied steps compensated, most recent first.
    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "apply:s1",
            "apply:s2",
            "apply:s3",
            "rollback:s2",
            "rollback:s1"
        ]
    );
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![
            AuditStatus::Started,
            AuditStatus::ExecutionFailed,
            AuditStatus::RolledBack,
            AuditStatus::RolledBack,
        ]
    );
    assert_eq!(result.rollback_outcomes.len(), 2);
}

#[tokio::test]
async fn test_non_tx_failed_rollback_step_does_not_stop_the_rest() {
    let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
    let journal = journal();
    let definition = ChangeDefinition::new(
        ChangeDescriptor::new("c1", "tester", "0001", "db"),
        Arc::new(RecordingStep::new("s1", journal.clone()).with_rollback()),
    )
    .with_step(Arc::new(
        RecordingStep::new("s2", journal.clone()).failing_rollback(),
    ))
    .with_step(Arc::new(RecordingStep::new("s3", journal.clone()).failing()));
    let target: Arc<dyn TargetSystem> = Arc::new(PlainTarget::new("db"));

    let result = execute_change(&recorder(&ledger), &definition, target)
        .await
        .unwrap();

    assert!(!result.succeeded());
    // s2's rollback fails but s1 is still compensated afterwards.
    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "apply:s1",
            "apply:s2",
            "apply:s3",
            "rollback:s2",
            "rollback:s1"
        ]
    );
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![
            AuditStatus::Started,
            AuditStatus::ExecutionFailed,
            AuditStatus::RollbackFailed,
            AuditStatus::RolledBack,
        ]
    );
}

/// Ledger wrapper recording every append into the shared journal, so
/// tests can assert how audit writes interleave with step bodies.
struct JournalingLedger {
    inner: InMemoryAuditLedger,
    journal: Journal,
}

#[async_trait]
impl AuditLedger for JournalingLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("audit:{}", entry.state.as_str()));
        self.inner.append(entry).await
    }

    async fn snapshot(&self) -> Result<AuditSnapshot> {
        self.inner.snapshot().await
    }

    async fn history(&self) -> Result<Vec<AuditEntry>> {
        self.inner.history().await
    }
}

#[tokio::test]
async fn test_non_tx_rollback_steps_are_audited_as_they_run() {
    let journal = journal();
    let ledger: Arc<dyn AuditLedger> = Arc::new(JournalingLedger {
        inner: InMemoryAuditLedger::new(),
        journal: journal.clone(),
    });
    let definition = three_step_definition("db", &journal);
    let target: Arc<dyn TargetSystem> = Arc::new(PlainTarget::new("db"));

    let result = execute_change(&recorder(&ledger), &definition, target)
        .await
        .unwrap();

    assert!(!result.succeeded());
    // Each compensating step's ledger entry lands before the next step
    // runs, never after the whole chain.
    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "audit:STARTED",
            "apply:s1",
            "apply:s2",
            "apply:s3",
            "audit:EXECUTION_FAILED",
            "rollback:s2",
            "audit:ROLLED_BACK",
            "rollback:s1",
            "audit:ROLLED_BACK",
        ]
    );
}

#[tokio::test]
async fn test_simple_tx_success_clears_marker() {
    let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
    let journal = journal();
    let target = Arc::new(SeparateTxTarget::new("db"));
    let definition = common::definition("c1", "0001", "db", RecordingStep::new("s1", journal));

    let result = execute_change(&recorder(&ledger), &definition, target.clone())
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![AuditStatus::Started, AuditStatus::Executed]
    );
    assert!(!target.has_marker("c1"));
}

#[tokio::test]
async fn test_simple_tx_failure_audits_auto_rollback_and_skips_first_chain_entry() {
    let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
    let journal = journal();
    let target = Arc::new(SeparateTxTarget::new("db"));
    let definition = three_step_definition("db", &journal);

    let result = execute_change(&recorder(&ledger), &definition, target.clone())
        .await
        .unwrap();

    assert!(!result.succeeded());
    // The target's own rollback covers s1; only s2 is compensated.
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["apply:s1", "apply:s2", "apply:s3", "rollback:s2"]
    );
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![
            AuditStatus::Started,
            AuditStatus::ExecutionFailed,
            AuditStatus::RolledBack,
            AuditStatus::RolledBack,
        ]
    );
    assert!(!target.has_marker("c1"));
}

#[tokio::test]
async fn test_shared_tx_success_commits_change_and_audit_together() {
    let staging = Arc::new(TxStagingLedger::new());
    let ledger: Arc<dyn AuditLedger> = staging.clone();
    let journal = journal();
    let target = Arc::new(SharedTxTarget::new("db", staging));
    let definition = common::definition("c1", "0001", "db", RecordingStep::new("s1", journal));

    let result = execute_change(&recorder(&ledger), &definition, target)
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![AuditStatus::Started, AuditStatus::Executed]
    );
}

#[tokio::test]
async fn test_staging_ledger_executes_changes_from_spawned_tasks() {
    let staging = Arc::new(TxStagingLedger::new());
    let ledger: Arc<dyn AuditLedger> = staging.clone();
    let ledger_after: Arc<dyn AuditLedger> = staging.clone();
    let journal = journal();
    let target: Arc<dyn TargetSystem> = Arc::new(PlainTarget::new("db"));
    let definition = common::definition("c1", "0001", "db", RecordingStep::new("s1", journal));

    // Runners drive changes from spawned tasks; every append, staged or
    // direct, must be able to cross the task boundary.
    let result = tokio::spawn(async move {
        execute_change(&recorder(&ledger), &definition, target)
            .await
            .unwrap()
    })
    .await
    .unwrap();

    assert!(result.succeeded());
    assert_eq!(
        states_for(&ledger_after, "c1").await,
        vec![AuditStatus::Started, AuditStatus::Executed]
    );
}

#[tokio::test]
async fn test_shared_tx_failure_discards_main_trail_and_writes_diagnostic() {
    let staging = Arc::new(TxStagingLedger::new());
    let ledger: Arc<dyn AuditLedger> = staging.clone();
    let journal = journal();
    let target = Arc::new(SharedTxTarget::new("db", staging));
    let definition = three_step_definition("db", &journal);

    let result = execute_change(&recorder(&ledger), &definition, target)
        .await
        .unwrap();

    assert!(!result.succeeded());
    // The aborted transaction discarded its STARTED entry; what remains
    // is the diagnostic trail plus the audited compensation of s2.
    assert_eq!(
        states_for(&ledger, "c1").await,
        vec![
            AuditStatus::Started,
            AuditStatus::ExecutionFailed,
            AuditStatus::RolledBack,
            AuditStatus::RolledBack,
        ]
    );
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["apply:s1", "apply:s2", "apply:s3", "rollback:s2"]
    );
}
