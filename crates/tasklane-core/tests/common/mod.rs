// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tasklane-core integration tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, a scripted remote
//! client and an orchestrator with short timings.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use tasklane_core::config::OrchestratorConfig;
use tasklane_core::migrations;
use tasklane_core::persistence::{NewRun, Persistence, RunRecord, SqlitePersistence};
use tasklane_core::remote::MockRemoteClient;
use tasklane_core::run::RunStatus;
use tasklane_core::{IdAllocator, RunOrchestrator, SequenceAllocator};

/// Create a migrated in-memory store.
pub async fn memory_persistence() -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    Arc::new(SqlitePersistence::new(pool))
}

/// Orchestrator timings scaled down for tests.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(20),
        poll_timeout: Duration::from_secs(5),
        preflight_timeout: Duration::from_millis(500),
        cancel_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_millis(500),
        max_insert_attempts: 3,
        retry_backoff_base: Duration::from_millis(1),
    }
}

/// Test context holding the store, the mock remote and the orchestrator.
pub struct TestContext {
    pub persistence: Arc<SqlitePersistence>,
    pub client: MockRemoteClient,
    pub orchestrator: RunOrchestrator,
}

impl TestContext {
    /// Context using the default sequence allocator and [`fast_config`].
    pub async fn new(client: MockRemoteClient) -> Self {
        Self::with_config(client, fast_config()).await
    }

    /// Context with custom timings.
    pub async fn with_config(client: MockRemoteClient, config: OrchestratorConfig) -> Self {
        let persistence = memory_persistence().await;
        let allocator = Arc::new(SequenceAllocator::new(persistence.clone()));
        Self::build(persistence, allocator, client, config)
    }

    /// Context with a custom allocator.
    pub async fn with_allocator(
        client: MockRemoteClient,
        allocator: Arc<dyn IdAllocator>,
    ) -> Self {
        let persistence = memory_persistence().await;
        Self::build(persistence, allocator, client, fast_config())
    }

    /// Context over an existing store.
    pub fn build(
        persistence: Arc<SqlitePersistence>,
        allocator: Arc<dyn IdAllocator>,
        client: MockRemoteClient,
        config: OrchestratorConfig,
    ) -> Self {
        let orchestrator = RunOrchestrator::new(
            persistence.clone(),
            allocator,
            Arc::new(client.clone()),
            config,
        );

        Self {
            persistence,
            client,
            orchestrator,
        }
    }

    /// Audit actions for a run, oldest first.
    pub async fn audit_actions(&self, run_id: &str) -> Vec<String> {
        self.persistence
            .list_audit(run_id)
            .await
            .expect("Failed to list audit records")
            .into_iter()
            .map(|r| r.action)
            .collect()
    }

    /// Insert a `running` row directly, as another process would have.
    pub async fn insert_running_run(
        &self,
        unique_id: &str,
        remote_job_id: Option<&str>,
    ) -> RunRecord {
        let run = NewRun {
            id: uuid::Uuid::new_v4().to_string(),
            unique_id: unique_id.to_string(),
            template_id: "7".to_string(),
            status: RunStatus::Running,
            parameters: "{}".to_string(),
            executed_by: Some("other-host".to_string()),
            started_at: Utc::now(),
        };
        self.persistence
            .insert_run(&run)
            .await
            .expect("Failed to insert run");

        if let Some(remote_job_id) = remote_job_id {
            self.persistence
                .attach_remote_job(&run.id, remote_job_id)
                .await
                .expect("Failed to attach remote job");
        }

        self.persistence
            .get_run(&run.id)
            .await
            .expect("Failed to fetch run")
            .expect("Run should exist")
    }
}
