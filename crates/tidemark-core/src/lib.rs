// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tidemark Core - Change Migration Engine
//!
//! This crate executes versioned changes against external target systems
//! exactly once across a fleet of runner processes, with a durable audit
//! trail and deterministic crash recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PipelineRunner                         │
//! │        loop: plan → acquire lock → re-plan → execute        │
//! └─────────────────────────────────────────────────────────────┘
//!        │                    │                     │
//!        ▼                    ▼                     ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────────┐
//! │ LockManager  │   │ ExecutionPlanner │   │   StageExecutor   │
//! │ lease + TTL  │   │ snapshot +       │   │ change strategies │
//! │ refresh task │   │ recovery matrix  │   │ non_tx/simple_tx/ │
//! └──────┬───────┘   └────────┬─────────┘   │ shared_tx         │
//!        │                    │             └─────────┬─────────┘
//!        ▼                    ▼                       ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────────┐
//! │  Lock Store  │   │   Audit Ledger   │   │  Target Systems   │
//! │ (shared by   │   │ (append-only,    │   │ (user databases,  │
//! │  all runners)│   │  shared)         │   │  services, ...)   │
//! └──────────────┘   └──────────────────┘   └───────────────────┘
//! ```
//!
//! # Execution Model
//!
//! A run is a pipeline of ordered stages, each an ordered list of
//! changes. Exactly one change executes at a time within one runner;
//! concurrency exists only across runners competing for the distributed
//! lease lock. Every attempt is audited before and after execution, so
//! a crash at any point leaves a ledger whose last entry per change is
//! its true last known state.
//!
//! # Recovery Decision Matrix
//!
//! On every pass the planner maps each change's latest audit entry to an
//! action:
//!
//! | Last entry | Action |
//! |------------|--------|
//! | none | Apply |
//! | `EXECUTED` | Skip |
//! | `STARTED` | Manual intervention |
//! | `EXECUTION_FAILED`, transactional target | Apply |
//! | `EXECUTION_FAILED`, non-transactional target | Manual intervention |
//! | `ROLLED_BACK` | Apply |
//! | `ROLLBACK_FAILED` | Manual intervention |
//! | `MANUAL_MARKED_AS_APPLIED` | Skip |
//! | `MANUAL_MARKED_AS_ROLLED_BACK` | Apply |
//! | unrecognized | Manual intervention |
//!
//! A change's declared run-always flag turns Skip into Apply; a declared
//! always-retry recovery strategy turns Manual intervention into Apply.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables, all optional:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TIDEMARK_LOCK_LEASE_MILLIS` | `60000` | Lease duration per acquire/extend |
//! | `TIDEMARK_LOCK_QUIT_TRYING_AFTER_MILLIS` | `180000` | Acquire retry budget |
//! | `TIDEMARK_LOCK_RETRY_FREQUENCY_MILLIS` | `1000` | Pause between acquire retries |
//! | `TIDEMARK_THROW_ON_LOCK_FAILURE` | `true` | Abort on lock contention |
//! | `TIDEMARK_ENABLE_LOCK_REFRESH` | `true` | Background lease refresh |
//! | `TIDEMARK_LOCK_REFRESH_FREQUENCY_MILLIS` | `15000` | Refresh pause |
//!
//! # Modules
//!
//! - [`audit`]: Audit ledger model, port, and lifecycle recorder
//! - [`change`]: Change definitions and the startup registry
//! - [`config`]: Runner configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`executor`]: Stage execution and the pipeline run loop
//! - [`lock`]: Distributed lease lock manager and refresher
//! - [`operations`]: Operator surface (history, fixes)
//! - [`pipeline`]: Pipeline and stage model
//! - [`planner`]: Execution planning over the recovery matrix
//! - [`recovery`]: The recovery decision matrix
//! - [`rollback`]: Rollback chain for compensating steps
//! - [`store`]: In-memory and SQLite backends
//! - [`strategy`]: Change process strategies per target capability
//! - [`target`]: Target system ports and registry

#![deny(missing_docs)]

/// Audit ledger model, port, and lifecycle recorder.
pub mod audit;

/// Change definitions and the startup registry.
pub mod change;

/// Runner configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations with stable error codes.
pub mod error;

/// Stage execution and the pipeline run loop.
pub mod executor;

/// Distributed lease lock manager and background refresher.
pub mod lock;

/// Operator surface: audit history and stuck-change fixes.
pub mod operations;

/// Pipeline and stage model.
pub mod pipeline;

/// Execution planning over the audit snapshot and recovery matrix.
pub mod planner;

/// The recovery decision matrix.
pub mod recovery;

/// Rollback chain for compensating steps.
pub mod rollback;

/// In-memory and SQLite audit ledger and lock store backends.
pub mod store;

/// Change process strategies, one per target transactional capability.
pub mod strategy;

/// Target system ports and registry.
pub mod target;
