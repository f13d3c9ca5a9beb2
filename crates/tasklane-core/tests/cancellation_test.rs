// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for user cancellation and host shutdown.

mod common;

use std::time::{Duration, Instant};

use common::*;
use serde_json::Value;

use tasklane_core::persistence::{NewAuditEntry, Persistence, RunCompletion, RunRecord};
use tasklane_core::remote::{MockRemoteClient, RemoteError};
use tasklane_core::run::AuditAction;
use tasklane_core::{CoreError, RunError, RunRequest, RunStatus};

/// Wait until the run has a remote handle.
async fn wait_for_launch(ctx: &TestContext, run_id: &str) -> RunRecord {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let record = ctx.persistence.get_run(run_id).await.unwrap().unwrap();
        if record.remote_job_id.is_some() {
            return record;
        }
        assert!(Instant::now() < deadline, "run was never launched");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn last_audit_detail(ctx: &TestContext, run_id: &str) -> Value {
    let audit = ctx.persistence.list_audit(run_id).await.unwrap();
    let detail = audit.last().unwrap().detail.as_deref().unwrap();
    serde_json::from_str(detail).unwrap()
}

#[tokio::test]
async fn test_cancel_with_hanging_remote_cancel() {
    let client = MockRemoteClient::never_completing().hanging_cancel();
    let ctx = TestContext::new(client).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let run_id = ticket.run_id.clone();
    wait_for_launch(&ctx, &run_id).await;

    let started = Instant::now();
    let record = ctx.orchestrator.cancel(&run_id).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(record.run_status(), Some(RunStatus::Canceled));
    assert_eq!(record.error_message.as_deref(), Some("Canceled by user"));
    assert!(record.completed_at.is_some());
    assert!(elapsed < Duration::from_secs(1), "cancel took {:?}", elapsed);
    assert_eq!(ctx.client.cancel_calls(), 1);

    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.run_status(), Some(RunStatus::Canceled));
    assert_eq!(ctx.audit_actions(&run_id).await, ["launched", "canceled"]);

    let detail = last_audit_detail(&ctx, &run_id).await;
    assert!(detail["remote_cancel"].as_str().unwrap().starts_with("timed out"));
    assert_eq!(detail["remote_job_id"], "1000");
}

#[tokio::test]
async fn test_cancel_stops_polling() {
    let ctx = TestContext::new(MockRemoteClient::never_completing()).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let run_id = ticket.run_id.clone();
    wait_for_launch(&ctx, &run_id).await;

    ctx.orchestrator.cancel(&run_id).await.unwrap();
    ticket.wait().await.unwrap();

    let polls = ctx.client.status_calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.client.status_calls(), polls);
    assert_eq!(ctx.client.canceled_jobs(), ["1000"]);
    assert!(ctx.orchestrator.in_flight().is_empty());
}

#[tokio::test]
async fn test_cancel_with_failing_remote_cancel() {
    let client = MockRemoteClient::never_completing()
        .with_cancel_error(RemoteError::Rejected {
            status: 405,
            detail: "job is not cancelable".to_string(),
        });
    let ctx = TestContext::new(client).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    wait_for_launch(&ctx, &ticket.run_id).await;

    let record = ctx.orchestrator.cancel(&ticket.run_id).await.unwrap();
    assert_eq!(record.run_status(), Some(RunStatus::Canceled));

    let detail = last_audit_detail(&ctx, &ticket.run_id).await;
    assert!(detail["remote_cancel"].as_str().unwrap().starts_with("failed"));
}

#[tokio::test]
async fn test_cancel_run_not_driven_here() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let run = ctx.insert_running_run("TASK26B0000000007i", Some("555")).await;

    let record = ctx.orchestrator.cancel(&run.id).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Canceled));
    assert_eq!(record.remote_job_id.as_deref(), Some("555"));
    assert_eq!(ctx.client.canceled_jobs(), ["555"]);
    assert_eq!(ctx.audit_actions(&run.id).await, ["canceled"]);
}

#[tokio::test]
async fn test_cancel_before_launch_skips_remote() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let run = ctx.insert_running_run("TASK26B0000000008i", None).await;

    let record = ctx.orchestrator.cancel(&run.id).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Canceled));
    assert_eq!(ctx.client.cancel_calls(), 0);
    let detail = last_audit_detail(&ctx, &run.id).await;
    assert_eq!(detail["remote_cancel"], "skipped");
}

#[tokio::test]
async fn test_cancel_terminal_run_is_rejected() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();
    assert_eq!(record.run_status(), Some(RunStatus::Success));

    let err = ctx.orchestrator.cancel(&record.id).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Store(CoreError::InvalidRunState { ref actual, .. }) if actual == "success"
    ));

    // Terminal row is untouched
    let after = ctx.orchestrator.get_run(&record.id).await.unwrap();
    assert_eq!(after.run_status(), Some(RunStatus::Success));
    assert_eq!(ctx.audit_actions(&record.id).await, ["launched", "completed"]);
}

#[tokio::test]
async fn test_cancel_unknown_run() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let err = ctx.orchestrator.cancel("no-such-run").await.unwrap_err();
    assert!(matches!(err, RunError::NotFound { .. }));
}

#[tokio::test]
async fn test_shutdown_interrupts_in_flight_runs() {
    let ctx = TestContext::new(MockRemoteClient::never_completing()).await;

    let first = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let second = ctx.orchestrator.submit(RunRequest::new("8")).await.unwrap();
    wait_for_launch(&ctx, &first.run_id).await;
    wait_for_launch(&ctx, &second.run_id).await;

    ctx.orchestrator.shutdown().await;

    for ticket in [first, second] {
        let run_id = ticket.run_id.clone();
        let record = ticket.wait().await.unwrap();
        assert_eq!(record.run_status(), Some(RunStatus::Failed));
        assert_eq!(record.error_kind.as_deref(), Some("interrupted"));
        let message = record.error_message.unwrap();
        assert!(message.contains(record.remote_job_id.as_deref().unwrap()));
        assert_eq!(ctx.audit_actions(&run_id).await, ["launched", "failed"]);
    }

    // Shutdown leaves remote jobs alone
    assert_eq!(ctx.client.cancel_calls(), 0);

    let polls = ctx.client.status_calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.client.status_calls(), polls);

    let err = ctx
        .orchestrator
        .submit(RunRequest::new("7"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Interrupted { remote_job_id: None }));
}

#[tokio::test]
async fn test_run_finished_elsewhere_during_launch_cancels_remote_job() {
    let client = MockRemoteClient::never_completing().with_launch_delay(Duration::from_millis(200));
    let ctx = TestContext::new(client).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let run_id = ticket.run_id.clone();

    let deadline = Instant::now() + Duration::from_secs(2);
    while ctx.client.launch_calls() == 0 {
        assert!(Instant::now() < deadline, "launch never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Another process cancels the row while the launch is in flight
    let mut completion = RunCompletion::new(RunStatus::Canceled);
    completion.error_message = Some("Canceled by user".to_string());
    let entry = NewAuditEntry {
        run_id: run_id.clone(),
        unique_id: ticket.unique_id.clone(),
        action: AuditAction::Canceled,
        outcome: "canceled".to_string(),
        detail: None,
    };
    assert!(
        ctx.persistence
            .complete_run_with_audit(&run_id, &completion, &entry)
            .await
            .unwrap()
    );

    let record = ticket.wait().await.unwrap();
    assert_eq!(record.run_status(), Some(RunStatus::Canceled));
    assert!(record.remote_job_id.is_none());
    assert_eq!(ctx.client.canceled_jobs(), ["1000"]);
    assert_eq!(ctx.client.status_calls(), 0);
    assert_eq!(ctx.audit_actions(&run_id).await, ["canceled"]);
}

#[tokio::test]
async fn test_aborted_run_task_is_marked_interrupted() {
    let ctx = TestContext::new(MockRemoteClient::new().panicking_status()).await;

    let ticket = ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap();
    let run_id = ticket.run_id.clone();

    let err = ticket.wait().await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Interrupted { remote_job_id: Some(ref id) } if id == "1000"
    ));

    let record = ctx.orchestrator.get_run(&run_id).await.unwrap();
    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert_eq!(record.error_kind.as_deref(), Some("interrupted"));
    assert!(record.completed_at.is_some());
    assert_eq!(ctx.audit_actions(&run_id).await, ["launched", "failed"]);
    assert!(ctx.orchestrator.in_flight().is_empty());
}
