// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipeline and stage model.
//!
//! A pipeline is an ordered list of named stages, each an ordered list
//! of change ids resolved against the [`ChangeRegistry`] at planning
//! time. Pipelines arrive already resolved from whatever authoring
//! produced them; the engine only validates and executes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One named, ordered group of changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage id, unique within the pipeline.
    pub id: String,
    /// Change ids in declared execution order.
    pub change_ids: Vec<String>,
}

impl Stage {
    /// Create a stage from an id and ordered change ids.
    pub fn new(id: &str, change_ids: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            change_ids,
        }
    }
}

/// An ordered list of stages making up one run.
///
/// Pipelines can be authored in code with [`Pipeline::with_stage`] or
/// deserialized from a declarative definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    /// Stages in declared execution order.
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// All change ids across all stages, in execution order.
    pub fn change_ids(&self) -> impl Iterator<Item = &str> {
        self.stages
            .iter()
            .flat_map(|s| s.change_ids.iter().map(String::as_str))
    }

    /// Validate structural invariants: non-empty ids, no duplicate stage
    /// ids, no change id appearing twice anywhere in the pipeline.
    pub fn validate(&self) -> Result<()> {
        let mut stage_ids = HashSet::new();
        let mut change_ids = HashSet::new();

        for stage in &self.stages {
            if stage.id.is_empty() {
                return Err(EngineError::PipelineValidation {
                    message: "stage with empty id".to_string(),
                });
            }
            if !stage_ids.insert(stage.id.as_str()) {
                return Err(EngineError::PipelineValidation {
                    message: format!("duplicate stage id '{}'", stage.id),
                });
            }
            for change_id in &stage.change_ids {
                if change_id.is_empty() {
                    return Err(EngineError::PipelineValidation {
                        message: format!("stage '{}' contains an empty change id", stage.id),
                    });
                }
                if !change_ids.insert(change_id.as_str()) {
                    return Err(EngineError::PipelineValidation {
                        message: format!(
                            "change id '{}' appears more than once in the pipeline",
                            change_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
