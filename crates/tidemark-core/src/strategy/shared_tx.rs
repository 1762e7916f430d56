// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strategy for targets sharing one transactional resource with the
//! audit ledger.
//!
//! One transaction holds the STARTED entry, the change body and the
//! terminal entry, so either the change and its audit trail commit
//! together or neither exists. A failed attempt therefore leaves no
//! trace; a second, purely diagnostic transaction rewrites the failure
//! trail (STARTED, EXECUTION_FAILED, ROLLED_BACK) afterwards, and its
//! own failure is logged without masking the original error.

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
    let started = Instant::now();
    let chain = Arc::new(Mutex::new(RollbackChain::new()));

    let tx_result = {
        let chain = chain.clone();
        let steps = definition.steps.clone();
        target
            .run_in_transaction(Box::pin(async move {
                recorder
                    .record_started(task, AuditTxType::SharedTx)
                    .await
                    .map_err(anyhow::Error::from)?;
                for (step_index, step) in steps.iter().enumerate() {
                    step.apply().await?;
                    chain
                        .lock()
                        .expect("rollback chain poisoned")
                        .push(step_index, step.clone());
                }
                recorder
                    .record_executed(task, AuditTxType::SharedTx, elapsed_millis(started))
                    .await
                    .map_err(anyhow::Error::from)?;
                Ok(())
            }))
            .await
    };

    let millis = elapsed_millis(started);
    let mut chain = std::mem::take(&mut *chain.lock().expect("rollback chain poisoned"));

    match tx_result {
        Ok(()) => Ok(ChangeProcessResult::applied(definition.id(), millis)),
        Err(err) => {
            let trace = format!("{:#}", err);
            error!(
                change_id = definition.id(),
                error = %trace,
                "Shared transaction aborted, change and audit trail both discarded"
            );

            // Diagnostic trail in its own transaction. Best effort only.
            let diagnostic = {
                let trace = trace.clone();
                target
                    .run_in_transaction(Box::pin(async move {
                        recorder
                            .record_started(task, AuditTxType::SharedTx)
                            .await
                            .map_err(anyhow::Error::from)?;
                        recorder
                            .record_execution_failed(task, AuditTxType::SharedTx, millis, &trace)
                            .await
                            .map_err(anyhow::Error::from)?;
                        recorder
                            .record_auto_rolled_back(task, AuditTxType::SharedTx)
                            .await
                            .map_err(anyhow::Error::from)?;
                        Ok(())
                    }))
                    .await
            };
            if let Err(diag_err) = diagnostic {
                warn!(
                    change_id = definition.id(),
                    error = %format!("{:#}", diag_err),
                    "Failed to write diagnostic failure trail"
                );
            }

            // The aborted transaction already undid the main change.
            chain.skip_first();
            let outcomes = replay_audited(recorder, task, AuditTxType::SharedTx, chain).await?;

            Ok(ChangeProcessResult::failed(
                definition.id(),
                millis,
                trace,
                outcomes,
            ))
        }
    }
}
