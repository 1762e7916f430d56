// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tidemark-core.
//!
//! Provides a unified error type for everything the engine can surface:
//! lock contention, change failures, audit-store failures, and the
//! designed manual-intervention halt state.

use chrono::{DateTime, Utc};
use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while planning or executing a migration run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// The process lock is held by another runner whose lease has not expired.
    LockHeldByOther {
        /// The lock key that is contended.
        key: String,
        /// The runner currently holding the lease.
        owner: String,
        /// When the current lease expires.
        until: DateTime<Utc>,
    },

    /// Attempted to extend or release a lock owned by a different runner.
    LockNotOwned {
        /// The lock key.
        key: String,
        /// The runner that attempted the operation.
        owner: String,
    },

    /// Lock acquisition gave up after exhausting its retry budget.
    LockAcquisitionTimedOut {
        /// The lock key.
        key: String,
        /// How long the runner kept trying, in milliseconds.
        tried_for_millis: u64,
    },

    /// One or more changes are in a state that requires an operator decision.
    ManualInterventionRequired {
        /// The change ids that are blocked.
        change_ids: Vec<String>,
    },

    /// A change body failed against its target system.
    ChangeFailed {
        /// The change that failed.
        change_id: String,
        /// The stage containing the change.
        stage_id: String,
        /// Error details from the change body.
        details: String,
    },

    /// A rollback step failed; the target system may be inconsistent.
    RollbackFailed {
        /// The change whose rollback failed.
        change_id: String,
        /// Error details from the rollback body.
        details: String,
    },

    /// An audit-ledger write failed. The change may already have been
    /// applied against the target system.
    AuditWriteFailed {
        /// The change whose audit entry could not be written.
        change_id: String,
        /// Error details from the ledger backend.
        details: String,
    },

    /// A stage references a change id with no registered definition.
    UnknownChange {
        /// The unresolved change id.
        change_id: String,
    },

    /// A change references a target system id with no registered target.
    UnknownTargetSystem {
        /// The unresolved target system id.
        target_system_id: String,
    },

    /// The pipeline definition is invalid (duplicate ids, empty stage names).
    PipelineValidation {
        /// Human-readable validation message.
        message: String,
    },

    /// A store backend operation failed.
    StoreError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LockHeldByOther { .. } => "LOCK_HELD_BY_OTHER",
            Self::LockNotOwned { .. } => "LOCK_NOT_OWNED",
            Self::LockAcquisitionTimedOut { .. } => "LOCK_ACQUISITION_TIMED_OUT",
            Self::ManualInterventionRequired { .. } => "MANUAL_INTERVENTION_REQUIRED",
            Self::ChangeFailed { .. } => "CHANGE_FAILED",
            Self::RollbackFailed { .. } => "ROLLBACK_FAILED",
            Self::AuditWriteFailed { .. } => "AUDIT_WRITE_FAILED",
            Self::UnknownChange { .. } => "UNKNOWN_CHANGE",
            Self::UnknownTargetSystem { .. } => "UNKNOWN_TARGET_SYSTEM",
            Self::PipelineValidation { .. } => "PIPELINE_VALIDATION",
            Self::StoreError { .. } => "STORE_ERROR",
        }
    }

    /// True for the lock-contention family of errors, which a runner may
    /// treat as "someone else is doing the work" rather than a failure.
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            Self::LockHeldByOther { .. } | Self::LockAcquisitionTimedOut { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockHeldByOther { key, owner, until } => {
                write!(f, "Lock '{}' still held by {} until {}", key, owner, until)
            }
            Self::LockNotOwned { key, owner } => {
                write!(f, "Lock '{}' is not owned by {}", key, owner)
            }
            Self::LockAcquisitionTimedOut {
                key,
                tried_for_millis,
            } => {
                write!(
                    f,
                    "Gave up acquiring lock '{}' after {}ms",
                    key, tried_for_millis
                )
            }
            Self::ManualInterventionRequired { change_ids } => {
                write!(
                    f,
                    "Manual intervention required for changes: {}",
                    change_ids.join(", ")
                )
            }
            Self::ChangeFailed {
                change_id,
                stage_id,
                details,
            } => {
                write!(
                    f,
                    "Change '{}' failed in stage '{}': {}",
                    change_id, stage_id, details
                )
            }
            Self::RollbackFailed { change_id, details } => {
                write!(f, "Rollback of change '{}' failed: {}", change_id, details)
            }
            Self::AuditWriteFailed { change_id, details } => {
                write!(
                    f,
                    "Failed to write audit entry for change '{}': {}",
                    change_id, details
                )
            }
            Self::UnknownChange { change_id } => {
                write!(f, "No change registered with id '{}'", change_id)
            }
            Self::UnknownTargetSystem { target_system_id } => {
                write!(
                    f,
                    "No target system registered with id '{}'",
                    target_system_id
                )
            }
            Self::PipelineValidation { message } => {
                write!(f, "Invalid pipeline: {}", message)
            }
            Self::StoreError { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::StoreError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::StoreError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(EngineError, &str)> = vec![
            (
                EngineError::LockHeldByOther {
                    key: "k".to_string(),
                    owner: "runner-a".to_string(),
                    until: Utc::now(),
                },
                "LOCK_HELD_BY_OTHER",
            ),
            (
                EngineError::LockNotOwned {
                    key: "k".to_string(),
                    owner: "runner-b".to_string(),
                },
                "LOCK_NOT_OWNED",
            ),
            (
                EngineError::ManualInterventionRequired {
                    change_ids: vec!["c1".to_string()],
                },
                "MANUAL_INTERVENTION_REQUIRED",
            ),
            (
                EngineError::ChangeFailed {
                    change_id: "c1".to_string(),
                    stage_id: "s1".to_string(),
                    details: "boom".to_string(),
                },
                "CHANGE_FAILED",
            ),
            (
                EngineError::AuditWriteFailed {
                    change_id: "c1".to_string(),
                    details: "disk full".to_string(),
                },
                "AUDIT_WRITE_FAILED",
            ),
            (
                EngineError::StoreError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "STORE_ERROR",
            ),
        ];

        for (error, expected_code) in cases {
            assert_eq!(error.error_code(), expected_code, "for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_lock_contention_classification() {
        let held = EngineError::LockHeldByOther {
            key: "k".to_string(),
            owner: "runner-a".to_string(),
            until: Utc::now(),
        };
        assert!(held.is_lock_contention());

        let timed_out = EngineError::LockAcquisitionTimedOut {
            key: "k".to_string(),
            tried_for_millis: 3000,
        };
        assert!(timed_out.is_lock_contention());

        let failed = EngineError::ChangeFailed {
            change_id: "c1".to_string(),
            stage_id: "s1".to_string(),
            details: "boom".to_string(),
        };
        assert!(!failed.is_lock_contention());
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::ChangeFailed {
            change_id: "add-index".to_string(),
            stage_id: "init".to_string(),
            details: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Change 'add-index' failed in stage 'init': timeout"
        );

        let err = EngineError::UnknownChange {
            change_id: "ghost".to_string(),
        };
        assert_eq!(err.to_string(), "No change registered with id 'ghost'");

        let err = EngineError::ManualInterventionRequired {
            change_ids: vec!["c1".to_string(), "c2".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Manual intervention required for changes: c1, c2"
        );
    }
}
