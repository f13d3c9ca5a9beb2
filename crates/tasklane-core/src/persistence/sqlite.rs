// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::CoreError;
use crate::migrations;

use super::{
    AuditRecord, CounterRecord, ListRunsFilter, NewAuditEntry, NewRun, Persistence, RunCompletion,
    RunRecord, map_insert_error,
};

const RUN_COLUMNS: &str = "id, unique_id, template_id, status, parameters, executed_by, \
     remote_job_id, result, artifacts, output, error_message, error_kind, started_at, completed_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// and runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/tasklane.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn increment_counter(&self, year: i32, pool: &str) -> Result<i64, CoreError> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO run_counters (year, pool, sequence, last_used)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT (year, pool) DO UPDATE
            SET sequence = run_counters.sequence + 1,
                last_used = excluded.last_used
            RETURNING sequence
            "#,
        )
        .bind(year)
        .bind(pool)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence)
    }

    async fn get_counter(&self, year: i32, pool: &str) -> Result<Option<CounterRecord>, CoreError> {
        let record = sqlx::query_as::<_, CounterRecord>(
            r#"
            SELECT year, pool, sequence, last_used
            FROM run_counters
            WHERE year = ?1 AND pool = ?2
            "#,
        )
        .bind(year)
        .bind(pool)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_counters(&self, year: i32) -> Result<Vec<CounterRecord>, CoreError> {
        let records = sqlx::query_as::<_, CounterRecord>(
            r#"
            SELECT year, pool, sequence, last_used
            FROM run_counters
            WHERE year = ?1
            ORDER BY pool ASC
            "#,
        )
        .bind(year)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_run(&self, run: &NewRun) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, unique_id, template_id, status, parameters, executed_by, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&run.id)
        .bind(&run.unique_id)
        .bind(&run.template_id)
        .bind(run.status.as_str())
        .bind(&run.parameters)
        .bind(&run.executed_by)
        .bind(run.started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &run.unique_id))?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let query = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let record = sqlx::query_as::<_, RunRecord>(&query)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn get_run_by_unique_id(&self, unique_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let query = format!("SELECT {} FROM runs WHERE unique_id = ?1", RUN_COLUMNS);
        let record = sqlx::query_as::<_, RunRecord>(&query)
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM runs
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY started_at DESC, unique_id DESC
            LIMIT ?2 OFFSET ?3
            "#,
            RUN_COLUMNS
        );
        let records = sqlx::query_as::<_, RunRecord>(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count_runs_in_year(&self, year: i32) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM runs
            WHERE CAST(substr(started_at, 1, 4) AS INTEGER) = ?1
            "#,
        )
        .bind(year)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn attach_remote_job(
        &self,
        run_id: &str,
        remote_job_id: &str,
    ) -> Result<bool, CoreError> {
        let mut conn = self.pool.acquire().await?;
        set_remote_job(&mut conn, run_id, remote_job_id).await
    }

    async fn complete_run_if_active(
        &self,
        run_id: &str,
        completion: &RunCompletion,
    ) -> Result<bool, CoreError> {
        let mut conn = self.pool.acquire().await?;
        set_completion(&mut conn, run_id, completion).await
    }

    async fn attach_remote_job_with_audit(
        &self,
        run_id: &str,
        remote_job_id: &str,
        audit: &NewAuditEntry,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let applied = set_remote_job(&mut tx, run_id, remote_job_id).await?;
        if applied {
            insert_audit(&mut tx, audit).await?;
        }

        tx.commit().await?;
        Ok(applied)
    }

    async fn complete_run_with_audit(
        &self,
        run_id: &str,
        completion: &RunCompletion,
        audit: &NewAuditEntry,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let applied = set_completion(&mut tx, run_id, completion).await?;
        if applied {
            insert_audit(&mut tx, audit).await?;
        }

        tx.commit().await?;
        Ok(applied)
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, entry).await
    }

    async fn list_audit(&self, run_id: &str) -> Result<Vec<AuditRecord>, CoreError> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT id, run_id, unique_id, action, outcome, detail, created_at
            FROM run_audit_log
            WHERE run_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

// ============================================================================
// Statements shared by the plain and transactional writes
// ============================================================================

async fn set_remote_job(
    conn: &mut SqliteConnection,
    run_id: &str,
    remote_job_id: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET remote_job_id = ?1,
            status = 'running'
        WHERE id = ?2
          AND status IN ('pending', 'running')
        "#,
    )
    .bind(remote_job_id)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn set_completion(
    conn: &mut SqliteConnection,
    run_id: &str,
    completion: &RunCompletion,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?1,
            result = ?2,
            artifacts = ?3,
            output = ?4,
            error_message = ?5,
            error_kind = ?6,
            completed_at = ?7
        WHERE id = ?8
          AND status IN ('pending', 'running')
        "#,
    )
    .bind(completion.status.as_str())
    .bind(&completion.result)
    .bind(&completion.artifacts)
    .bind(&completion.output)
    .bind(&completion.error_message)
    .bind(&completion.error_kind)
    .bind(completion.completed_at)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn insert_audit(conn: &mut SqliteConnection, entry: &NewAuditEntry) -> Result<(), CoreError> {
    let detail = entry
        .detail
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO run_audit_log (run_id, unique_id, action, outcome, detail, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&entry.run_id)
    .bind(&entry.unique_id)
    .bind(entry.action.as_str())
    .bind(&entry.outcome)
    .bind(detail)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
