// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for runs whose audit record cannot be written.
//!
//! A status change and its audit record commit together, so a broken audit
//! log leaves the run where it was instead of terminal with no trail.

mod common;

use common::*;

use tasklane_core::persistence::Persistence;
use tasklane_core::remote::MockRemoteClient;
use tasklane_core::{RunError, RunRequest, RunStatus};

async fn drop_audit_log(ctx: &TestContext) {
    sqlx::query("DROP TABLE run_audit_log")
        .execute(ctx.persistence.pool())
        .await
        .expect("Failed to drop audit log");
}

#[tokio::test]
async fn test_failed_audit_keeps_run_out_of_terminal_status() {
    let ctx = TestContext::new(MockRemoteClient::unreachable()).await;
    drop_audit_log(&ctx).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let run_id = ticket.run_id.clone();
    let err = ticket.wait().await.unwrap_err();
    assert!(matches!(err, RunError::Store(_)));

    let row = ctx.persistence.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(row.run_status(), Some(RunStatus::Running));
    assert!(row.completed_at.is_none());
    assert!(row.error_message.is_none());
    assert_eq!(ctx.client.launch_calls(), 0);
}

#[tokio::test]
async fn test_unrecorded_launch_cancels_remote_job() {
    let ctx = TestContext::new(MockRemoteClient::never_completing()).await;
    drop_audit_log(&ctx).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let run_id = ticket.run_id.clone();
    let err = ticket.wait().await.unwrap_err();
    assert!(matches!(err, RunError::Store(_)));

    // The remote job is not left running without a poll loop
    assert_eq!(ctx.client.launch_calls(), 1);
    assert_eq!(ctx.client.canceled_jobs(), ["1000"]);
    assert_eq!(ctx.client.status_calls(), 0);
    assert!(ctx.orchestrator.in_flight().is_empty());

    let row = ctx.persistence.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(row.run_status(), Some(RunStatus::Running));
    assert!(row.remote_job_id.is_none());
    assert!(row.completed_at.is_none());
}
