// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite Migration Example - Durable audit trail across restarts.
//!
//! This example shows:
//! - Loading runner configuration from TIDEMARK_* environment variables
//! - Persisting the audit ledger and lock in a SQLite file
//! - Re-running the same pipeline: already-applied changes are skipped
//!
//! Run with: cargo run -p migration-example --bin sqlite_migration

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use tidemark_core::audit::AuditLedger;
use tidemark_core::change::{ChangeDefinition, ChangeDescriptor, ChangeRegistry, ChangeStep};
use tidemark_core::config::RunnerConfig;
use tidemark_core::executor::{PipelineRunner, StageExecutor};
use tidemark_core::lock::{LockKey, LockManager, RunnerId};
use tidemark_core::pipeline::{Pipeline, Stage};
use tidemark_core::planner::ExecutionPlanner;
use tidemark_core::store::sqlite::SqliteBackend;
use tidemark_core::target::{TargetRegistry, TargetSystem, TxCapability};

struct DemoDatabase;

impl TargetSystem for DemoDatabase {
    fn id(&self) -> &str {
        "demo-db"
    }

    fn capability(&self) -> TxCapability {
        TxCapability::None
    }
}

struct AddIndexes;

#[async_trait]
impl ChangeStep for AddIndexes {
    async fn apply(&self) -> anyhow::Result<()> {
        info!("adding indexes");
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

    info!("=== SQLite Migration Example ===");

    let config = RunnerConfig::from_env()?;
    let backend = SqliteBackend::from_path(".data/migrations.db").await?;
    let ledger: Arc<dyn AuditLedger> = Arc::new(backend.audit_ledger());

    let mut targets = TargetRegistry::new();
    targets.register(Arc::new(DemoDatabase));

    let mut registry = ChangeRegistry::new();
    registry.register(ChangeDefinition::new(
        ChangeDescriptor::new("add-indexes", "bob", "0001", "demo-db"),
        Arc::new(AddIndexes),
    ))?;

    let pipeline =
        Pipeline::new().with_stage(Stage::new("schema", vec!["add-indexes".to_string()]));

    let planner = ExecutionPlanner::new(ledger.clone(), registry, targets.clone());
    let lock = LockManager::new(
        Arc::new(backend.lock_store()),
        RunnerId::generate(),
        LockKey::default(),
        config.lock_options(),
    );
    let runner = PipelineRunner::new(
        planner,
        lock,
        StageExecutor::new(targets),
        ledger,
        config.runner_options(),
    );

    let summary = runner.run(&pipeline).await?;
    info!(
        applied = ?summary.applied,
        skipped = summary.skipped,
        "Run complete; run again to see the change skipped"
    );

    Ok(())
}
