// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for tasklane-core.
//!
//! This module defines the storage abstraction the allocator and the
//! orchestrator are written against, plus SQLite and PostgreSQL backends.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::run::{AuditAction, RunStatus, clamped_duration};

/// Counter row for one `(year, pool)` pair.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CounterRecord {
    /// Calendar year the counter applies to.
    pub year: i32,
    /// Pool label (single character).
    pub pool: String,
    /// Last issued sequence.
    pub sequence: i64,
    /// When the sequence was last incremented.
    pub last_used: DateTime<Utc>,
}

/// Run row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct RunRecord {
    /// Internal opaque identifier (UUID).
    pub id: String,
    /// Human-readable allocated identifier.
    pub unique_id: String,
    /// Remote template the run launches.
    pub template_id: String,
    /// Current status (pending, running, success, failed, canceled).
    pub status: String,
    /// Original form input, serialized JSON.
    pub parameters: String,
    /// Who triggered the run.
    pub executed_by: Option<String>,
    /// Remote handle, null until launch succeeds.
    pub remote_job_id: Option<String>,
    /// Final remote snapshot, serialized JSON.
    pub result: Option<String>,
    /// Remote artifacts, serialized JSON.
    pub artifacts: Option<String>,
    /// Remote stdout.
    pub output: Option<String>,
    /// Human-readable failure message.
    pub error_message: Option<String>,
    /// Machine-readable failure kind.
    pub error_kind: Option<String>,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Parsed status. Unknown values are reported as `None`.
    pub fn run_status(&self) -> Option<RunStatus> {
        self.status.parse().ok()
    }

    /// Whether the row has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.run_status().is_some_and(|s| s.is_terminal())
    }

    /// Elapsed time from start to completion, clamped at zero.
    /// `None` while the run is not terminal.
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at
            .map(|completed_at| clamped_duration(self.started_at, completed_at))
    }

    /// Deserialized artifacts.
    pub fn artifacts_json(&self) -> Option<serde_json::Value> {
        self.artifacts
            .as_deref()
            .and_then(|a| serde_json::from_str(a).ok())
    }

    /// Deserialized parameters.
    pub fn parameters_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.parameters).ok()
    }
}

/// Values for a new run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Internal opaque identifier.
    pub id: String,
    /// Allocated or reserved unique identifier.
    pub unique_id: String,
    /// Remote template id.
    pub template_id: String,
    /// Initial status, `pending` or `running`.
    pub status: RunStatus,
    /// Serialized form input, stored verbatim.
    pub parameters: String,
    /// Who triggered the run.
    pub executed_by: Option<String>,
    /// Creation timestamp.
    pub started_at: DateTime<Utc>,
}

/// Terminal values written by [`Persistence::complete_run_if_active`].
#[derive(Debug, Clone)]
pub struct RunCompletion {
    /// Terminal status.
    pub status: RunStatus,
    /// Final remote snapshot.
    pub result: Option<String>,
    /// Remote artifacts.
    pub artifacts: Option<String>,
    /// Remote stdout.
    pub output: Option<String>,
    /// Human-readable failure message.
    pub error_message: Option<String>,
    /// Machine-readable failure kind.
    pub error_kind: Option<String>,
    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
}

impl RunCompletion {
    /// Completion with only a status and timestamp set.
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            result: None,
            artifacts: None,
            output: None,
            error_message: None,
            error_kind: None,
            completed_at: Utc::now(),
        }
    }
}

/// Audit log row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AuditRecord {
    /// Database primary key.
    pub id: i64,
    /// Internal run id.
    pub run_id: String,
    /// Run unique id.
    pub unique_id: String,
    /// Transition (launched, failed, completed, timed_out, canceled).
    pub action: String,
    /// Outcome of the transition.
    pub outcome: String,
    /// Free-form JSON detail.
    pub detail: Option<String>,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

/// Values for a new audit record.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    /// Internal run id.
    pub run_id: String,
    /// Run unique id.
    pub unique_id: String,
    /// Transition.
    pub action: AuditAction,
    /// Outcome of the transition.
    pub outcome: String,
    /// Free-form JSON detail.
    pub detail: Option<serde_json::Value>,
}

/// Filter options for listing runs.
#[derive(Debug, Clone)]
pub struct ListRunsFilter {
    /// Only runs in this status.
    pub status: Option<RunStatus>,
    /// Maximum rows (default 100).
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl Default for ListRunsFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Storage for counters, runs and the audit log.
///
/// Implementations must make [`increment_counter`](Self::increment_counter)
/// a single atomic statement and
/// [`complete_run_if_active`](Self::complete_run_if_active) a guarded update,
/// so correctness holds across processes sharing one database. The
/// `*_with_audit` variants must commit the status change and its audit
/// record together or not at all.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Counters
    // ========================================================================

    /// Create the `(year, pool)` counter at 1 or increment it, returning the
    /// post-increment sequence.
    async fn increment_counter(&self, year: i32, pool: &str) -> Result<i64, CoreError>;

    /// Read a counter without modifying it.
    async fn get_counter(&self, year: i32, pool: &str) -> Result<Option<CounterRecord>, CoreError>;

    /// All counters for a year, ordered by pool.
    async fn list_counters(&self, year: i32) -> Result<Vec<CounterRecord>, CoreError>;

    // ========================================================================
    // Runs
    // ========================================================================

    /// Insert a run row. A taken `unique_id` yields
    /// [`CoreError::UniqueIdConflict`].
    async fn insert_run(&self, run: &NewRun) -> Result<(), CoreError>;

    /// Fetch a run by internal id.
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// Fetch a run by unique id.
    async fn get_run_by_unique_id(&self, unique_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// List runs, newest first.
    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError>;

    /// Count runs started in a year.
    async fn count_runs_in_year(&self, year: i32) -> Result<i64, CoreError>;

    /// Persist the remote handle and move the run to `running`.
    /// Returns `false` when the run is already terminal.
    async fn attach_remote_job(&self, run_id: &str, remote_job_id: &str)
    -> Result<bool, CoreError>;

    /// Write a terminal status if the run is still `pending` or `running`.
    /// Returns whether the write applied.
    async fn complete_run_if_active(
        &self,
        run_id: &str,
        completion: &RunCompletion,
    ) -> Result<bool, CoreError>;

    /// [`attach_remote_job`](Self::attach_remote_job) and `audit` in one
    /// transaction. Nothing is written when the run is already terminal.
    async fn attach_remote_job_with_audit(
        &self,
        run_id: &str,
        remote_job_id: &str,
        audit: &NewAuditEntry,
    ) -> Result<bool, CoreError>;

    /// [`complete_run_if_active`](Self::complete_run_if_active) and `audit`
    /// in one transaction. The audit record is written only if the guarded
    /// update applied; a failed audit insert rolls the update back.
    async fn complete_run_with_audit(
        &self,
        run_id: &str,
        completion: &RunCompletion,
        audit: &NewAuditEntry,
    ) -> Result<bool, CoreError>;

    // ========================================================================
    // Audit log
    // ========================================================================

    /// Append an audit record.
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<(), CoreError>;

    /// Audit records for a run, oldest first.
    async fn list_audit(&self, run_id: &str) -> Result<Vec<AuditRecord>, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Map a sqlx insert error, turning unique violations into
/// [`CoreError::UniqueIdConflict`].
pub(crate) fn map_insert_error(err: sqlx::Error, unique_id: &str) -> CoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::UniqueIdConflict {
            unique_id: unique_id.to_string(),
        },
        other => other.into(),
    }
}
