// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage execution and the pipeline run loop.
//!
//! One change executes at a time within one runner; concurrency exists
//! only across runner processes competing for the lock. The run loop
//! re-plans on every pass so work finished by another runner, or fixed
//! by an operator between passes, is picked up without a restart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::audit::{AuditLedger, AuditRecorder, ExecutionContext};
use crate::error::{EngineError, Result};
use crate::lock::LockManager;
use crate::pipeline::Pipeline;
use crate::planner::{ExecutionPlan, ExecutionPlanner, PlannedStage};
use crate::strategy::execute_change;
use crate::target::TargetRegistry;

/// The first failed change of a run.
#[derive(Debug, Clone)]
pub struct ChangeFailure {
    /// The change that failed.
    pub change_id: String,
    /// The stage containing it.
    pub stage_id: String,
    /// Error details from the change body.
    pub details: String,
}

/// Outcome of executing one planned stage.
#[derive(Debug, Default)]
pub struct StageSummary {
    /// The stage id.
    pub stage_id: String,
    /// Change ids applied, in execution order.
    pub applied: Vec<String>,
    /// The failure that aborted the stage, if any.
    pub failed: Option<ChangeFailure>,
}

/// Aggregate outcome of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    /// Change ids applied across all passes, in execution order.
    pub applied: Vec<String>,
    /// Changes skipped as already applied (last pass's count).
    pub skipped: usize,
    /// Number of plan-execute passes taken.
    pub passes: u32,
    /// The failure that aborted the run, if any.
    pub failed: Option<ChangeFailure>,
}

impl PipelineSummary {
    /// True when every planned change applied.
    pub fn succeeded(&self) -> bool {
        self.failed.is_none()
    }

    /// Convert a failed summary into the corresponding error.
    pub fn into_result(self) -> Result<Self> {
        match &self.failed {
            None => Ok(self),
            Some(failure) => Err(EngineError::ChangeFailed {
                change_id: failure.change_id.clone(),
                stage_id: failure.stage_id.clone(),
                details: failure.details.clone(),
            }),
        }
    }
}

/// Executes one planned stage's changes in declared order, fail-fast.
pub struct StageExecutor {
    targets: TargetRegistry,
}

impl StageExecutor {
    /// Create an executor over the given target registry.
    pub fn new(targets: TargetRegistry) -> Self {
        Self { targets }
    }

    /// Execute every change of the planned stage in order. The first
    /// failed change aborts the stage; its details land in the summary.
    pub async fn execute(
        &self,
        recorder: &AuditRecorder,
        planned: &PlannedStage,
    ) -> Result<StageSummary> {
        let mut summary = StageSummary {
            stage_id: planned.stage_id.clone(),
            ..StageSummary::default()
        };

        for definition in &planned.changes {
            let target = self.targets.resolve(&definition.descriptor.target_system_id)?;
            let result = execute_change(recorder, definition, target).await?;
            match result.outcome {
                crate::strategy::ChangeOutcome::Applied => {
                    summary.applied.push(definition.id().to_string());
                }
                crate::strategy::ChangeOutcome::Failed { error } => {
                    error!(
                        change_id = definition.id(),
                        stage_id = %planned.stage_id,
                        error = %error,
                        "Change failed, aborting stage"
                    );
                    summary.failed = Some(ChangeFailure {
                        change_id: definition.id().to_string(),
                        stage_id: planned.stage_id.clone(),
                        details: error,
                    });
                    return Ok(summary);
                }
            }
        }

        Ok(summary)
    }
}

/// Whether lock refresh runs in the background during a pass.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Abort the run on lock contention instead of ending it cleanly.
    pub throw_on_lock_failure: bool,
    /// Keep the lease extended by a background task while executing.
    pub enable_lock_refresh: bool,
    /// Pause between background lease extensions.
    pub refresh_frequency: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            throw_on_lock_failure: true,
            enable_lock_refresh: true,
            refresh_frequency: Duration::from_secs(15),
        }
    }
}

/// Drives the plan-lock-execute loop for one pipeline.
pub struct PipelineRunner {
    planner: ExecutionPlanner,
    lock: LockManager,
    executor: StageExecutor,
    ledger: Arc<dyn AuditLedger>,
    options: RunnerOptions,
}

impl PipelineRunner {
    /// Assemble a runner from its collaborators.
    pub fn new(
        planner: ExecutionPlanner,
        lock: LockManager,
        executor: StageExecutor,
        ledger: Arc<dyn AuditLedger>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            planner,
            lock,
            executor,
            ledger,
            options,
        }
    }

    /// Run the pipeline to completion.
    ///
    /// Each pass plans from a fresh snapshot, acquires the lock only
    /// when there is work, re-plans under the lock, and executes. The
    /// run ends when a pass finds nothing pending. A change failure
    /// lands in the summary; engine-level failures (manual intervention
    /// required, lock contention when configured to abort, audit write
    /// failures) return an error.
    pub async fn run(&self, pipeline: &Pipeline) -> Result<PipelineSummary> {
        let context = ExecutionContext::new_execution();
        let mut summary = PipelineSummary::default();
        // Guards the loop against run-always changes replanning forever.
        let mut applied_this_run: HashSet<String> = HashSet::new();

        loop {
            summary.passes += 1;

            // First snapshot, without the lock. Nothing pending means
            // the run is already complete and the lock is never taken.
            let plan = self.planner.plan(pipeline, &context).await?;
            let plan = prune_applied(plan, &applied_this_run);
            summary.skipped = plan.skipped;
            if plan.is_empty() {
                info!(passes = summary.passes, "No pending changes, run complete");
                return Ok(summary);
            }

            let lease = match self.lock.acquire().await {
                Ok(lease) => lease,
                Err(err) if err.is_lock_contention() => {
                    if self.options.throw_on_lock_failure {
                        return Err(err);
                    }
                    info!(error = %err, "Lock contention, ending run without executing");
                    return Ok(summary);
                }
                Err(err) => return Err(err),
            };
            let refresher = self
                .options
                .enable_lock_refresh
                .then(|| lease.spawn_refresher(self.options.refresh_frequency));

            let pass = self
                .execute_pass(pipeline, &context, &mut summary, &mut applied_this_run)
                .await;

            if let Some(refresher) = refresher {
                refresher.stop().await;
            }
            lease.release().await;

            match pass {
                Ok(true) => continue,
                Ok(false) => return Ok(summary),
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute one pass under the lock. Returns whether another pass
    /// should follow.
    async fn execute_pass(
        &self,
        pipeline: &Pipeline,
        context: &ExecutionContext,
        summary: &mut PipelineSummary,
        applied_this_run: &mut HashSet<String>,
    ) -> Result<bool> {
        // Second snapshot, now authoritative: another runner may have
        // finished the work between the first snapshot and the lock.
        // Only here, under the lock, are interrupted changes reconciled.
        let plan = self.planner.plan_reconciling(pipeline, context).await?;
        let plan = prune_applied(plan, applied_this_run);
        summary.skipped = plan.skipped;
        if plan.is_empty() {
            info!("No work left after authoritative re-plan, releasing lock");
            return Ok(false);
        }

        info!(
            pending = plan.pending(),
            stages = plan.stages.len(),
            "Executing plan"
        );

        for planned in &plan.stages {
            let recorder =
                AuditRecorder::new(self.ledger.clone(), context.clone(), &planned.stage_id);
            let stage_summary = self.executor.execute(&recorder, planned).await?;

            for change_id in &stage_summary.applied {
                applied_this_run.insert(change_id.clone());
            }
            summary.applied.extend(stage_summary.applied.iter().cloned());

            if let Some(failure) = stage_summary.failed {
                summary.failed = Some(failure);
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn prune_applied(mut plan: ExecutionPlan, applied_this_run: &HashSet<String>) -> ExecutionPlan {
    for stage in &mut plan.stages {
        stage
            .changes
            .retain(|definition| !applied_this_run.contains(definition.id()));
    }
    plan.stages.retain(|stage| !stage.changes.is_empty());
    plan
}
