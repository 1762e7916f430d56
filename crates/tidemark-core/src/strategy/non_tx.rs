// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strategy for targets without atomic rollback.
//!
//! Audit STARTED, apply the steps, audit the terminal result. A failed
//! step leaves partial effects behind, so the accumulated rollback
//! chain replays in reverse with best effort and every compensating
//! step is audited individually.

use std::time::Instant;

use tracing::error;

use crate::audit::{AuditRecorder, AuditTxType};
use crate::change::ChangeDefinition;
use crate::error::Result;
use crate::rollback::RollbackChain;

use super::{ChangeProcessResult, elapsed_millis, replay_audited};

pub(super) async fn execute(
    recorder: &AuditRecorder,
    definition: &ChangeDefinition,
) -> Result<ChangeProcessResult> {
    let task = &definition.descriptor;
    recorder.record_started(task, AuditTxType::NonTx).await?;

    let started = Instant::now();
    let mut chain = RollbackChain::new();

    for (step_index, step) in definition.steps.iter().enumerate() {
        match step.apply().await {
            Ok(()) => chain.push(step_index, step.clone()),
            Err(err) => {
                let millis = elapsed_millis(started);
                let trace = format!("{:#}", err);
                error!(
                    change_id = definition.id(),
                    step_index,
                    error = %trace,
                    "Change step failed on non-transactional target"
                );
                recorder
                    .record_execution_failed(task, AuditTxType::NonTx, millis, &trace)
                    .await?;

                let outcomes = replay_audited(recorder, task, AuditTxType::NonTx, chain).await?;

                return Ok(ChangeProcessResult::failed(
                    definition.id(),
                    millis,
                    trace,
                    outcomes,
                ));
            }
        }
    }

    let millis = elapsed_millis(started);
    recorder
        .record_executed(task, AuditTxType::NonTx, millis)
        .await?;
    Ok(ChangeProcessResult::applied(definition.id(), millis))
}
