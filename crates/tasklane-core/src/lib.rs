// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Core - Run Orchestration
//!
//! This crate turns a request to run a remote automation job template into a
//! tracked run: it allocates a unique identifier, launches the job on an
//! AWX-compatible job server, polls it to completion and reconciles the
//! remote outcome into a durable row plus an audit trail.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Callers (CLI, services)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ RunRequest
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RunOrchestrator                                  │
//! │     submit / cancel / shutdown / preview / next-id / counter stats       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!       │                 │                    │                    │
//!       ▼                 ▼                    ▼                    ▼
//! ┌────────────┐  ┌──────────────┐  ┌───────────────────┐  ┌──────────────┐
//! │ IdAllocator│  │ RunRequest / │  │  RemoteJobClient  │  │  Persistence │
//! │ (counters) │  │  templating  │  │ (AWX HTTP / mock) │  │ (SQLite/PG)  │
//! └────────────┘  └──────────────┘  └───────────────────┘  └──────────────┘
//! ```
//!
//! # Run Identifiers
//!
//! | Part | Example | Meaning |
//! |------|---------|---------|
//! | prefix | `TASK` | literal |
//! | year | `26` | UTC year mod 100 |
//! | pool | `C` | counter shard derived from the caller's group or user |
//! | sequence | `0000000042` | per `(year, pool)` counter, 10 digits |
//! | suffix | `i` | literal |
//!
//! # Run Status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `pending` | Row exists, not yet driven |
//! | `running` | Preflight, launch or polling in progress |
//! | `success` | Remote job finished successfully |
//! | `failed` | Any failure, see `error_kind` |
//! | `canceled` | Canceled by a user or on the remote system |
//!
//! Terminal statuses are final. Every terminal write is guarded on the row
//! still being `pending` or `running`, so concurrent writers cannot regress
//! a finished run.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TASKLANE_DATABASE_URL` | required | `sqlite:` or `postgres:` URL |
//! | `TASKLANE_REMOTE_BASE_URL` | empty | Job server base URL |
//! | `TASKLANE_REMOTE_TOKEN` | empty | Bearer token |
//! | `TASKLANE_POLL_INTERVAL_SECS` | 5 | Delay between status polls |
//! | `TASKLANE_POLL_TIMEOUT_SECS` | 300 | Total poll budget per run |
//! | `TASKLANE_REQUEST_TIMEOUT_SECS` | 30 | Per-request timeout |
//! | `TASKLANE_MAX_INSERT_ATTEMPTS` | 3 | Id allocation retries (max 5) |
//!
//! # Modules
//!
//! - [`allocator`] - Unique id allocation over `(year, pool)` counters
//! - [`config`] - Environment configuration
//! - [`error`] - Error types and failure kinds
//! - [`migrations`] - Embedded SQLite and PostgreSQL migrations
//! - [`orchestrator`] - Run lifecycle
//! - [`persistence`] - Storage trait and backends
//! - [`preview`] - Equivalent launch request previews
//! - [`remote`] - Remote job server clients
//! - [`request`] - Run requests and body sources
//! - [`run`] - Run status and audit actions
//! - [`template`] - `{{form.<field>}}` placeholder rendering

#![deny(missing_docs)]

/// Unique run id allocation.
pub mod allocator;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Run lifecycle orchestration.
pub mod orchestrator;

/// Persistence layer for counters, runs and audit records.
pub mod persistence;

/// Equivalent launch request previews.
pub mod preview;

/// Remote job server clients.
pub mod remote;

/// Run requests and body sources.
pub mod request;

/// Run status and audit vocabulary.
pub mod run;

/// Placeholder rendering.
pub mod template;

pub use allocator::{IdAllocator, PoolHint, SequenceAllocator};
pub use error::{CoreError, ErrorKind, RunError};
pub use orchestrator::{RunOrchestrator, RunTicket};
pub use request::{Actor, BodySource, RunRequest};
pub use run::RunStatus;
