// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Basic Migration Example - A pipeline over the in-memory backends.
//!
//! This example shows:
//! - Defining change steps with apply and rollback bodies
//! - Registering changes and target systems
//! - Running a two-stage pipeline
//! - Inspecting the audit history afterwards
//!
//! Run with: cargo run -p migration-example --bin basic_migration

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use tidemark_core::audit::AuditLedger;
use tidemark_core::change::{ChangeDefinition, ChangeDescriptor, ChangeRegistry, ChangeStep};
use tidemark_core::executor::{PipelineRunner, RunnerOptions, StageExecutor};
use tidemark_core::lock::{LockKey, LockManager, LockOptions, RunnerId};
use tidemark_core::operations;
use tidemark_core::pipeline::{Pipeline, Stage};
use tidemark_core::planner::ExecutionPlanner;
use tidemark_core::store::memory::{InMemoryAuditLedger, InMemoryLockStore};
use tidemark_core::target::{TargetRegistry, TargetSystem, TxCapability};

/// A target standing in for some external system without transactions.
struct DemoDatabase;

impl TargetSystem for DemoDatabase {
    fn id(&self) -> &str {
        "demo-db"
    }

    fn capability(&self) -> TxCapability {
        TxCapability::None
    }
}

/// Creates the users collection.
struct CreateUsersCollection;

#[async_trait]
impl ChangeStep for CreateUsersCollection {
    async fn apply(&self) -> anyhow::Result<()> {
        info!("creating users collection");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        info!("dropping users collection");
        Ok(())
    }

    fn has_rollback(&self) -> bool {
        true
    }
}

/// Seeds the initial admin user.
struct SeedAdminUser;

#[async_trait]
impl ChangeStep for SeedAdminUser {
    async fn apply(&self) -> anyhow::Result<()> {
        info!("seeding admin user");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Basic Migration Example ===");

    let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
    let lock_store = Arc::new(InMemoryLockStore::new());

    let mut targets = TargetRegistry::new();
    targets.register(Arc::new(DemoDatabase));

    let mut registry = ChangeRegistry::new();
    registry.register(ChangeDefinition::new(
        ChangeDescriptor::new("create-users", "alice", "0001", "demo-db"),
        Arc::new(CreateUsersCollection),
    ))?;
    registry.register(ChangeDefinition::new(
        ChangeDescriptor::new("seed-admin", "alice", "0002", "demo-db"),
        Arc::new(SeedAdminUser),
    ))?;

    let pipeline = Pipeline::new()
        .with_stage(Stage::new("schema", vec!["create-users".to_string()]))
        .with_stage(Stage::new("data", vec!["seed-admin".to_string()]));

    let planner = ExecutionPlanner::new(ledger.clone(), registry, targets.clone());
    let lock = LockManager::new(
        lock_store,
        RunnerId::generate(),
        LockKey::default(),
        LockOptions::default(),
    );
    let runner = PipelineRunner::new(
        planner,
        lock,
        StageExecutor::new(targets),
        ledger.clone(),
        RunnerOptions::default(),
    );

    let summary = runner.run(&pipeline).await?;
    info!(
        applied = ?summary.applied,
        passes = summary.passes,
        "Run complete"
    );

    for entry in operations::audit_history(&ledger).await? {
        info!(
            change_id = %entry.change_id,
            state = entry.state.as_str(),
            "audit entry"
        );
    }

    Ok(())
}
