// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollback chain.
//!
//! As the steps of one change succeed, their compensating operations
//! accumulate here. On failure the chain replays in reverse. The chain
//! lives only for one attempt; only its effects are persisted, as audit
//! entries written by the strategies.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::change::ChangeStep;

/// Outcome of one replayed rollback step.
#[derive(Debug)]
pub struct RollbackStepOutcome {
    /// Position of the step in the original apply order (0-based).
    pub step_index: usize,
    /// Wall-clock duration of the rollback body in milliseconds.
    pub execution_millis: i64,
    /// Error message when the rollback body failed.
    pub error: Option<String>,
}

impl RollbackStepOutcome {
    /// True when the rollback body completed without error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Ordered accumulator of compensating operations for one attempt.
#[derive(Default)]
pub struct RollbackChain {
    steps: Vec<(usize, Arc<dyn ChangeStep>)>,
}

impl RollbackChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully applied step so it can be compensated.
    pub fn push(&mut self, step_index: usize, step: Arc<dyn ChangeStep>) {
        self.steps.push((step_index, step));
    }

    /// Number of accumulated steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drop the earliest entry. Used by transactional strategies whose
    /// target already undid the main change via its own rollback.
    pub fn skip_first(&mut self) {
        if !self.steps.is_empty() {
            self.steps.remove(0);
        }
    }

    /// Remove and run the most recently accumulated step, with best
    /// effort: a failing rollback body is captured in the outcome, not
    /// surfaced. Steps without a declared rollback are logged and
    /// skipped. Returns `None` once the chain is exhausted, so the
    /// caller can act on every outcome before the next step runs.
    pub async fn replay_next(&mut self) -> Option<RollbackStepOutcome> {
        while let Some((step_index, step)) = self.steps.pop() {
            if !step.has_rollback() {
                debug!(step_index, "Step declares no rollback, skipping");
                continue;
            }

            let started = std::time::Instant::now();
            let result = step.rollback().await;
            let execution_millis = started.elapsed().as_millis() as i64;

            return Some(match result {
                Ok(()) => {
                    debug!(step_index, "Rollback step completed");
                    RollbackStepOutcome {
                        step_index,
                        execution_millis,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(step_index, error = %err, "Rollback step failed, continuing chain");
                    RollbackStepOutcome {
                        step_index,
                        execution_millis,
                        error: Some(format!("{:#}", err)),
                    }
                }
            });
        }

        None
    }
}

impl std::fmt::Debug for RollbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackChain")
            .field("steps", &self.steps.len())
            .finish()
    }
}
