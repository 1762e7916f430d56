// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Change process strategies.
//!
//! A strategy is the audit protocol wrapped around one change attempt.
//! Which one runs is decided once per target system by its declared
//! [`TxCapability`] and never changes for the life of a change:
//!
//! - [`TxCapability::None`] -> [`non_tx`]: audit around a bare apply,
//!   compensating rollback chain on failure.
//! - [`TxCapability::SeparateStore`] -> [`simple_tx`]: target-native
//!   transaction plus an in-target applied-marker bridging the gap to
//!   the separate audit store.
//! - [`TxCapability::SharedStore`] -> [`shared_tx`]: one transaction
//!   holding both the change and its audit trail.

mod non_tx;
mod shared_tx;
mod simple_tx;

use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{AuditRecorder, AuditTxType};
use crate::change::{ChangeDefinition, ChangeDescriptor};
use crate::error::{EngineError, Result};
use crate::rollback::{RollbackChain, RollbackStepOutcome};
use crate::target::{TargetSystem, TransactionalTarget, TxCapability};

/// Terminal outcome of one change attempt.
#[derive(Debug)]
pub enum ChangeOutcome {
    /// The change body completed and its terminal audit entry is durable.
    Applied,
    /// The change body failed; the error and any rollback activity are
    /// recorded in the surrounding [`ChangeProcessResult`].
    Failed {
        /// Error details from the change body.
        error: String,
    },
}

/// Result of driving one change through its strategy.
#[derive(Debug)]
pub struct ChangeProcessResult {
    /// The change that was attempted.
    pub change_id: String,
    /// Applied or failed.
    pub outcome: ChangeOutcome,
    /// Wall-clock duration of the apply phase in milliseconds.
    pub execution_millis: i64,
    /// Outcome of every compensating rollback step replayed on failure.
    pub rollback_outcomes: Vec<RollbackStepOutcome>,
}

impl ChangeProcessResult {
    /// True when the change was applied.
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ChangeOutcome::Applied)
    }

    fn applied(change_id: &str, execution_millis: i64) -> Self {
        Self {
            change_id: change_id.to_string(),
            outcome: ChangeOutcome::Applied,
            execution_millis,
            rollback_outcomes: Vec::new(),
        }
    }

    fn failed(
        change_id: &str,
        execution_millis: i64,
        error: String,
        rollback_outcomes: Vec<RollbackStepOutcome>,
    ) -> Self {
        Self {
            change_id: change_id.to_string(),
            outcome: ChangeOutcome::Failed { error },
            execution_millis,
            rollback_outcomes,
        }
    }
}

/// Execute one change with the strategy matching its target system.
///
/// Returns `Ok` with a failed [`ChangeProcessResult`] when the change
/// body failed but the strategy completed its audit protocol; returns
/// `Err` only for engine-level failures (audit writes on the success
/// path, misdeclared targets).
pub async fn execute_change(
    recorder: &AuditRecorder,
    definition: &ChangeDefinition,
    target: Arc<dyn TargetSystem>,
) -> Result<ChangeProcessResult> {
    info!(
        change_id = definition.id(),
        target_system_id = target.id(),
        capability = ?target.capability(),
        "Executing change"
    );

    match target.capability() {
        TxCapability::None => non_tx::execute(recorder, definition).await,
        TxCapability::SeparateStore => {
            let tx_target = require_transactional(target.as_ref(), definition)?;
            simple_tx::execute(recorder, definition, tx_target).await
        }
        TxCapability::SharedStore => {
            let tx_target = require_transactional(target.as_ref(), definition)?;
            shared_tx::execute(recorder, definition, tx_target).await
        }
    }
}

fn require_transactional<'a>(
    target: &'a dyn TargetSystem,
    definition: &ChangeDefinition,
) -> Result<&'a dyn TransactionalTarget> {
    target
        .as_transactional()
        .ok_or_else(|| EngineError::PipelineValidation {
            message: format!(
                "target system '{}' declares a transactional capability but \
                 exposes no transactional operations (change '{}')",
                target.id(),
                definition.id()
            ),
        })
}

fn elapsed_millis(started: std::time::Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

/// Replay the chain in reverse order, auditing every compensating step
/// before the next one runs. A crash mid-replay therefore leaves no
/// executed compensation without its ledger entry.
async fn replay_audited(
    recorder: &AuditRecorder,
    task: &ChangeDescriptor,
    tx_type: AuditTxType,
    mut chain: RollbackChain,
) -> Result<Vec<RollbackStepOutcome>> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = chain.replay_next().await {
        recorder
            .record_manual_rollback(
                task,
                tx_type,
                outcome.execution_millis,
                outcome.error.as_deref(),
            )
            .await?;
        if let Some(err) = &outcome.error {
            warn!(
                change_id = %task.id,
                step_index = outcome.step_index,
                error = %err,
                "Compensating rollback step failed"
            );
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
