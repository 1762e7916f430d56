// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strategy for targets with their own transactions, audited in a
//! separate store.
//!
//! Sequence: audit STARTED, then inside one target transaction apply
//! the steps and set the in-target applied-marker, commit, audit
//! EXECUTED, clear the marker. The marker makes a crash between commit
//! and the EXECUTED audit entry visible: its presence means the change
//! was applied but never confirmed.
//!
//! When the transaction aborts, the target undid the change itself; the
//! strategy audits EXECUTION_FAILED then ROLLED_BACK, and replays the
//! remaining chain (minus its first entry, covered by the native
//! rollback) with audited compensating steps.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{error, warn};

use crate::audit::{AuditRecorder, AuditTxType};
use crate::change::ChangeDefinition;
use crate::error::Result;
use crate::rollback::RollbackChain;
use crate::target::TransactionalTarget;

use super::{ChangeProcessResult, elapsed_millis, replay_audited};

pub(super) async fn execute(
    recorder: &AuditRecorder,
    definition: &ChangeDefinition,
    target: &dyn TransactionalTarget,
) -> Result<ChangeProcessResult> {
    let task = &definition.descriptor;
    recorder.record_started(task, AuditTxType::SeparateTx).await?;

    let started = Instant::now();
    let chain = Arc::new(Mutex::new(RollbackChain::new()));

    let tx_result = {
        let chain = chain.clone();
        let steps = definition.steps.clone();
        target
            .run_in_transaction(Box::pin(async move {
                for (step_index, step) in steps.iter().enumerate() {
                    step.apply().await?;
                    chain
                        .lock()
                        .expect("rollback chain poisoned")
                        .push(step_index, step.clone());
                }
                target.mark_applied(task).await.map_err(anyhow::Error::from)?;
                Ok(())
            }))
            .await
    };

    let millis = elapsed_millis(started);
    let mut chain = std::mem::take(&mut *chain.lock().expect("rollback chain poisoned"));

    match tx_result {
        Ok(()) => {
            recorder
                .record_executed(task, AuditTxType::SeparateTx, millis)
                .await?;
            // The marker did its job; a failed clear is recovered by the
            // planner's marker reconciliation on the next run.
            if let Err(err) = target.clear_mark(&task.id).await {
                warn!(
                    change_id = definition.id(),
                    error = %err,
                    "Failed to clear applied-marker after confirmation"
                );
            }
            Ok(ChangeProcessResult::applied(definition.id(), millis))
        }
        Err(err) => {
            let trace = format!("{:#}", err);
            error!(
                change_id = definition.id(),
                error = %trace,
                "Change transaction aborted, target rolled back natively"
            );
            recorder
                .record_execution_failed(task, AuditTxType::SeparateTx, millis, &trace)
                .await?;
            recorder
                .record_auto_rolled_back(task, AuditTxType::SeparateTx)
                .await?;

            // The native rollback already covers the first chain entry.
            chain.skip_first();
            let outcomes = replay_audited(recorder, task, AuditTxType::SeparateTx, chain).await?;

            Ok(ChangeProcessResult::failed(
                definition.id(),
                millis,
                trace,
                outcomes,
            ))
        }
    }
}
