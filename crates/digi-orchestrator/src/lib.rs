// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Digi Orchestrator - deployment orchestration core
//!
//! Drives every multi-system change to a tenant service through a durable
//! job queue:
//!
//! ```text
//!   mutation ──► jobs table ──► worker ──► handler ──► hypervisor
//!      │             ▲            ▲                  ├► proxy (edge + VM)
//!      └── jobs:new ─┼────────────┘                  ├► DNS provider
//!                    │                               ├► container engine
//!             stale requeue                          └► database
//! ```
//!
//! # Job lifecycle
//!
//! ```text
//!   pending ──claim──► processing ──ok──► completed
//!      ▲                  │  │
//!      │           error  │  └── error, attempts exhausted ──► failed
//!      │                  ▼
//!      └──── delay ─── retrying
//! ```
//!
//! A job left in `processing` longer than the staleness timeout is
//! requeued as `retrying`, or failed once its attempts are used up. At most
//! one job per service is `processing` at a time.
//!
//! # Modules
//!
//! - [`queue`]: job enqueue, claim and terminal transitions
//! - [`worker`]: the poll + pub/sub driven job loop
//! - [`handlers`]: deploy, destroy, scale and build
//! - [`services`]: mutation entry points that enqueue jobs
//! - [`persistence`]: Postgres and in-memory storage
//! - [`cache`], [`pubsub`]: Redis and in-memory backends
//! - [`node_directory`]: warm cache of hypervisor nodes
//! - [`runtime`]: embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Cached derived views and their invalidation.
pub mod cache;

/// Worker configuration loaded from environment variables.
pub mod config;

/// Error types for orchestrator operations.
pub mod error;

/// Deploy, destroy, scale and build job handlers.
pub mod handlers;

/// Database migrations.
pub mod migrations;

/// Process-wide cache of hypervisor node records.
pub mod node_directory;

/// Durable state: jobs, services, containers, VMs, domains, deployments.
pub mod persistence;

/// Notification bus for job wake-ups and deployment progress.
pub mod pubsub;

/// Durable job queue.
pub mod queue;

/// Embeddable runtime.
pub mod runtime;

/// Mutation entry points.
pub mod services;

/// Background job worker.
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use queue::{JobCommand, JobKind, JobQueue};
pub use runtime::OrchestratorRuntime;
pub use services::ServiceCommands;
pub use worker::{Worker, WorkerConfig};
