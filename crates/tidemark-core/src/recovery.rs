// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery decision matrix.
//!
//! Before anything executes, every candidate change is classified from
//! its latest audit entry into apply, skip, or manual intervention.
//! The matrix is total; anything it does not recognize halts for an
//! operator rather than resuming execution.

use tracing::debug;

use crate::audit::{AuditEntry, AuditStatus, AuditTxType, RecoveryStrategy};
use crate::change::ChangeDescriptor;

/// Action the planner takes for one change on this pass. Computed fresh
/// on every pass, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Execute the change.
    Apply,
    /// Already applied; nothing to do.
    Skip,
    /// Halt this change until an operator issues a fix.
    ManualIntervention,
}

/// Core decision matrix: map (last audit state, transaction type) to an
/// action.
///
/// A missing entry means the change never ran. STARTED with no terminal
/// follow-up means the previous attempt was interrupted mid-flight and
/// its side effects are unknown. EXECUTION_FAILED is only retryable when
/// the target's own transaction guarantees nothing was committed.
pub fn decide(last_status: Option<AuditStatus>, tx_type: Option<AuditTxType>) -> ChangeAction {
    let Some(status) = last_status else {
        return ChangeAction::Apply;
    };

    match status {
        AuditStatus::Executed | AuditStatus::MarkedAppliedByOperator => ChangeAction::Skip,
        AuditStatus::Started => ChangeAction::ManualIntervention,
        AuditStatus::ExecutionFailed => match tx_type {
            Some(tx) if tx.is_transactional() => ChangeAction::Apply,
            _ => ChangeAction::ManualIntervention,
        },
        AuditStatus::RolledBack | AuditStatus::MarkedRolledBackByOperator => ChangeAction::Apply,
        AuditStatus::RollbackFailed => ChangeAction::ManualIntervention,
        AuditStatus::Unknown => ChangeAction::ManualIntervention,
    }
}

/// Resolve the action for one change, layering the task-level overrides
/// on top of [`decide`]:
///
/// - `run_always` re-applies a change even when its latest entry is
///   EXECUTED;
/// - [`RecoveryStrategy::AlwaysRetry`] converts a manual-intervention
///   verdict into a retry, for changes declared idempotent.
pub fn resolve_action(entry: Option<&AuditEntry>, task: &ChangeDescriptor) -> ChangeAction {
    let last_status = entry.map(|e| e.state);
    let tx_type = entry.and_then(|e| e.tx_type);

    let action = match decide(last_status, tx_type) {
        ChangeAction::Skip if task.run_always => ChangeAction::Apply,
        ChangeAction::ManualIntervention if task.recovery == RecoveryStrategy::AlwaysRetry => {
            ChangeAction::Apply
        }
        action => action,
    };

    debug!(
        change_id = %task.id,
        last_status = last_status.map(|s| s.as_str()).unwrap_or("none"),
        action = ?action,
        "Change classified"
    );

    action
}
