// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Change definitions and the startup registry.
//!
//! A change is one idempotent, identified operation against a target
//! system. Change types implement the fixed [`ChangeStep`] contract and
//! are registered by id in a [`ChangeRegistry`] built at startup - no
//! runtime reflection, no classpath scanning.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::audit::RecoveryStrategy;
use crate::error::{EngineError, Result};

/// One executable step of a change: the apply body and, optionally, a
/// compensating rollback body.
///
/// Bodies return `anyhow::Result` so user code can use `?` against its
/// own error types; the engine records failures as audit entries and
/// wraps them in [`EngineError`].
#[async_trait]
pub trait ChangeStep: Send + Sync {
    /// Apply this step against its target system.
    async fn apply(&self) -> anyhow::Result<()>;

    /// Undo this step. Only called when [`ChangeStep::has_rollback`]
    /// returns true.
    async fn rollback(&self) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("no rollback defined"))
    }

    /// Whether this step declares a compensating rollback.
    fn has_rollback(&self) -> bool {
        false
    }

    /// Origin reference recorded in audit entries, defaulting to the
    /// concrete type name.
    fn origin(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Descriptor of one change: everything the engine needs to plan and
/// audit it, without the executable bodies.
#[derive(Debug, Clone)]
pub struct ChangeDescriptor {
    /// Unique change id.
    pub id: String,
    /// Declared author.
    pub author: String,
    /// Ordering key within the stage (lexicographic, e.g. "0001").
    pub order: String,
    /// Target system this change mutates.
    pub target_system_id: String,
    /// Recovery strategy when a previous attempt left ambiguous state.
    pub recovery: RecoveryStrategy,
    /// Re-apply on every run even when already executed.
    pub run_always: bool,
    /// Engine-internal change, excluded from user-facing summaries.
    pub system_change: bool,
    /// Origin reference recorded in audit entries.
    pub origin: String,
    /// Opaque metadata copied into every audit entry.
    pub metadata: serde_json::Value,
}

impl ChangeDescriptor {
    /// Create a descriptor with defaults for the optional fields.
    pub fn new(id: &str, author: &str, order: &str, target_system_id: &str) -> Self {
        Self {
            id: id.to_string(),
            author: author.to_string(),
            order: order.to_string(),
            target_system_id: target_system_id.to_string(),
            recovery: RecoveryStrategy::default(),
            run_always: false,
            system_change: false,
            origin: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the recovery strategy.
    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Mark the change as run-always.
    pub fn with_run_always(mut self, run_always: bool) -> Self {
        self.run_always = run_always;
        self
    }

    /// Attach opaque metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A change ready to execute: its descriptor plus its ordered steps.
///
/// Simple changes have one step. Multi-step definitions execute their
/// steps in order within one attempt, accumulating rollback entries for
/// each successful step.
#[derive(Clone)]
pub struct ChangeDefinition {
    /// The change descriptor.
    pub descriptor: ChangeDescriptor,
    /// Ordered executable steps; never empty.
    pub steps: Vec<Arc<dyn ChangeStep>>,
}

impl ChangeDefinition {
    /// Create a single-step definition.
    pub fn new(mut descriptor: ChangeDescriptor, step: Arc<dyn ChangeStep>) -> Self {
        if descriptor.origin.is_empty() {
            descriptor.origin = step.origin();
        }
        Self {
            descriptor,
            steps: vec![step],
        }
    }

    /// Append an additional step to the definition.
    pub fn with_step(mut self, step: Arc<dyn ChangeStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// The change id.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for ChangeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDefinition")
            .field("descriptor", &self.descriptor)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// Lookup table from change id to definition, built once at startup.
#[derive(Default, Clone)]
pub struct ChangeRegistry {
    definitions: BTreeMap<String, ChangeDefinition>,
}

impl ChangeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Re-registering an id is a validation error.
    pub fn register(&mut self, definition: ChangeDefinition) -> Result<()> {
        let id = definition.id().to_string();
        if self.definitions.contains_key(&id) {
            return Err(EngineError::PipelineValidation {
                message: format!("change '{}' registered twice", id),
            });
        }
        self.definitions.insert(id, definition);
        Ok(())
    }

    /// Resolve a change id, failing with [`EngineError::UnknownChange`].
    pub fn resolve(&self, change_id: &str) -> Result<&ChangeDefinition> {
        self.definitions
            .get(change_id)
            .ok_or_else(|| EngineError::UnknownChange {
                change_id: change_id.to_string(),
            })
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// True when no definitions are registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl std::fmt::Debug for ChangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRegistry")
            .field("ids", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStep;

    #[async_trait]
    impl ChangeStep for NoopStep {
        async fn apply(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn definition(id: &str) -> ChangeDefinition {
        ChangeDefinition::new(
            ChangeDescriptor::new(id, "tester", "0001", "ts"),
            Arc::new(NoopStep),
        )
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ChangeRegistry::new();
        registry.register(definition("c1")).unwrap();
        registry.register(definition("c2")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("c1").unwrap().id(), "c1");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ChangeRegistry::new();
        registry.register(definition("c1")).unwrap();
        let err = registry.register(definition("c1")).unwrap_err();
        assert!(matches!(err, EngineError::PipelineValidation { .. }));
    }

    #[test]
    fn test_unknown_change_resolution() {
        let registry = ChangeRegistry::new();
        let err = registry.resolve("ghost").unwrap_err();
        assert!(matches!(err, EngineError::UnknownChange { .. }));
    }

    #[test]
    fn test_definition_origin_defaults_to_step_type() {
        let def = definition("c1");
        assert!(def.descriptor.origin.contains("NoopStep"));
    }

    #[test]
    fn test_multi_step_definition() {
        let def = definition("c1").with_step(Arc::new(NoopStep));
        assert_eq!(def.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_default_rollback_errors() {
        let step = NoopStep;
        assert!(!step.has_rollback());
        assert!(step.rollback().await.is_err());
    }
}
