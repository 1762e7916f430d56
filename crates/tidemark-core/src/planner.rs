// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution planning.
//!
//! The planner turns a pipeline plus the current audit snapshot into an
//! executable plan: the ordered subset of changes whose recovery action
//! is Apply. Any change resolving to ManualIntervention fails the plan
//! before anything executes.

use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{AuditLedger, AuditRecorder, AuditSnapshot, AuditStatus, ExecutionContext};
use crate::change::{ChangeDefinition, ChangeRegistry};
use crate::error::{EngineError, Result};
use crate::pipeline::Pipeline;
use crate::recovery::{ChangeAction, resolve_action};
use crate::target::{TargetRegistry, TxCapability};

/// One stage's executable subset.
#[derive(Clone)]
pub struct PlannedStage {
    /// The stage id.
    pub stage_id: String,
    /// Changes to apply, in declared order.
    pub changes: Vec<ChangeDefinition>,
}

/// The executable subset of one pipeline pass.
#[derive(Default)]
pub struct ExecutionPlan {
    /// Stages with at least one change to apply, in declared order.
    pub stages: Vec<PlannedStage>,
    /// Number of changes skipped as already applied.
    pub skipped: usize,
}

impl ExecutionPlan {
    /// True when no change needs to run.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Total number of changes to apply.
    pub fn pending(&self) -> usize {
        self.stages.iter().map(|s| s.changes.len()).sum()
    }
}

/// Builds execution plans from the audit snapshot and the recovery
/// decision matrix.
pub struct ExecutionPlanner {
    ledger: Arc<dyn AuditLedger>,
    registry: ChangeRegistry,
    targets: TargetRegistry,
}

impl ExecutionPlanner {
    /// Create a planner over the given ledger and registries.
    pub fn new(
        ledger: Arc<dyn AuditLedger>,
        registry: ChangeRegistry,
        targets: TargetRegistry,
    ) -> Self {
        Self {
            ledger,
            registry,
            targets,
        }
    }

    /// Compute the executable plan for one pass without writing to any
    /// store. Safe to call without holding the lock.
    ///
    /// A change stuck in STARTED whose applied-marker is still set
    /// counts as pending here; it forces lock acquisition so that
    /// [`ExecutionPlanner::plan_reconciling`] can confirm it.
    ///
    /// Fails with [`EngineError::ManualInterventionRequired`] listing
    /// every blocked change, so the operator sees the full picture in
    /// one pass rather than one change at a time.
    pub async fn plan(
        &self,
        pipeline: &Pipeline,
        context: &ExecutionContext,
    ) -> Result<ExecutionPlan> {
        self.plan_inner(pipeline, context, false).await
    }

    /// Compute the executable plan and reconcile interrupted changes.
    /// The caller must hold the lock: reconciliation appends recovery
    /// entries to the ledger and clears applied-markers.
    pub async fn plan_reconciling(
        &self,
        pipeline: &Pipeline,
        context: &ExecutionContext,
    ) -> Result<ExecutionPlan> {
        self.plan_inner(pipeline, context, true).await
    }

    async fn plan_inner(
        &self,
        pipeline: &Pipeline,
        context: &ExecutionContext,
        reconcile: bool,
    ) -> Result<ExecutionPlan> {
        pipeline.validate()?;
        let snapshot = self.ledger.snapshot().await?;

        let mut plan = ExecutionPlan::default();
        let mut blocked: Vec<String> = Vec::new();

        for stage in &pipeline.stages {
            let mut changes = Vec::new();
            for change_id in &stage.change_ids {
                let definition = self.registry.resolve(change_id)?.clone();
                let action = self
                    .resolve(&snapshot, &definition, &stage.id, context, reconcile)
                    .await?;
                match action {
                    ChangeAction::Apply => changes.push(definition),
                    ChangeAction::Skip => plan.skipped += 1,
                    ChangeAction::ManualIntervention => blocked.push(change_id.clone()),
                }
            }
            if !changes.is_empty() {
                plan.stages.push(PlannedStage {
                    stage_id: stage.id.clone(),
                    changes,
                });
            }
        }

        if !blocked.is_empty() {
            warn!(
                change_ids = ?blocked,
                "Changes require manual intervention, aborting plan"
            );
            return Err(EngineError::ManualInterventionRequired {
                change_ids: blocked,
            });
        }

        Ok(plan)
    }

    /// Resolve the recovery action for one change.
    ///
    /// A change stuck in STARTED on a separate-store target whose marker
    /// is still present crashed between commit and audit confirmation:
    /// the change is durably applied. With `reconcile` set (lock held) a
    /// recovery EXECUTED entry is appended, the marker cleared, and the
    /// change skipped; without it the change is reported as pending so
    /// the runner takes the lock first.
    async fn resolve(
        &self,
        snapshot: &AuditSnapshot,
        definition: &ChangeDefinition,
        stage_id: &str,
        context: &ExecutionContext,
        reconcile: bool,
    ) -> Result<ChangeAction> {
        let task = &definition.descriptor;
        let entry = snapshot.get(&task.id);

        if let Some(entry) = entry
            && entry.state == AuditStatus::Started
        {
            let target = self.targets.resolve(&task.target_system_id)?;
            if target.capability() == TxCapability::SeparateStore
                && let Some(tx_target) = target.as_transactional()
                && tx_target.is_marked_applied(&task.id).await?
            {
                if !reconcile {
                    return Ok(ChangeAction::Apply);
                }
                info!(
                    change_id = %task.id,
                    "Applied-marker present for interrupted change, confirming as executed"
                );
                let recorder =
                    AuditRecorder::new(self.ledger.clone(), context.clone(), stage_id);
                recorder
                    .record_executed(task, TxCapability::SeparateStore.audit_tx_type(), 0)
                    .await?;
                tx_target.clear_mark(&task.id).await?;
                return Ok(if task.run_always {
                    ChangeAction::Apply
                } else {
                    ChangeAction::Skip
                });
            }
        }

        Ok(resolve_action(entry, task))
    }
}
