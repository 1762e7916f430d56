// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator surface.
//!
//! Read the ledger and fix stuck changes. Fixes never rewrite history:
//! they append a new terminal entry on top, which the recovery matrix
//! then reads as Skip (marked applied) or Apply (marked rolled back) on
//! the next run.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::audit::{AuditEntry, AuditLedger, AuditStatus, ExecutionKind, runner_hostname};
use crate::error::{EngineError, Result};

/// Full audit history in insertion order.
pub async fn audit_history(ledger: &Arc<dyn AuditLedger>) -> Result<Vec<AuditEntry>> {
    ledger.history().await
}

/// Mark a stuck change as applied. The change is skipped on the next
/// run until something changes its state again.
pub async fn mark_applied(
    ledger: &Arc<dyn AuditLedger>,
    change_id: &str,
    operator: &str,
) -> Result<()> {
    append_fix(ledger, change_id, operator, AuditStatus::MarkedAppliedByOperator).await
}

/// Mark a stuck change as rolled back. The change is re-applied on the
/// next run.
pub async fn mark_rolled_back(
    ledger: &Arc<dyn AuditLedger>,
    change_id: &str,
    operator: &str,
) -> Result<()> {
    append_fix(
        ledger,
        change_id,
        operator,
        AuditStatus::MarkedRolledBackByOperator,
    )
    .await
}

/// Append an operator-fix entry derived from the change's latest entry.
/// Only changes that have been attempted can be fixed.
async fn append_fix(
    ledger: &Arc<dyn AuditLedger>,
    change_id: &str,
    operator: &str,
    state: AuditStatus,
) -> Result<()> {
    let snapshot = ledger.snapshot().await?;
    let last = snapshot
        .get(change_id)
        .ok_or_else(|| EngineError::UnknownChange {
            change_id: change_id.to_string(),
        })?;

    let entry = AuditEntry {
        execution_id: format!("operator-{}", uuid::Uuid::new_v4()),
        created_at: Utc::now(),
        state,
        kind: ExecutionKind::Execution,
        execution_millis: 0,
        execution_hostname: runner_hostname(),
        error_trace: None,
        metadata: serde_json::json!({ "operator": operator }),
        ..last.clone()
    };
    ledger.append(&entry).await?;

    info!(
        change_id,
        operator,
        state = state.as_str(),
        "Operator fix recorded"
    );
    Ok(())
}
