// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations.
//!
//! Both dialects create `run_counters`, `runs` and `run_audit_log` with the
//! same columns and versions. The persistence `connect` constructors apply
//! them; hosts that build their own pool call [`run_sqlite`] or
//! [`run_postgres`] first.

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{PgPool, SqlitePool};

/// PostgreSQL schema.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite schema.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Apply pending PostgreSQL migrations.
pub async fn run_postgres(pool: &PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Apply pending SQLite migrations.
pub async fn run_sqlite(pool: &SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
