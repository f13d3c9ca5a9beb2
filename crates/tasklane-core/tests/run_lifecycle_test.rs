// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the run lifecycle against a scripted remote.

mod common;

use std::time::{Duration, Instant};

use common::*;
use serde_json::{Value, json};

use tasklane_core::persistence::{ListRunsFilter, Persistence};
use tasklane_core::remote::{MockRemoteClient, RemoteError, RemoteStatus};
use tasklane_core::{BodySource, ErrorKind, RunRequest, RunStatus};

fn params(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_successful_run() {
    let client = MockRemoteClient::new()
        .with_statuses([RemoteStatus::Running])
        .with_final_status(RemoteStatus::Successful)
        .with_artifacts(json!({"x": 1}))
        .with_output("PLAY RECAP ok=3");
    let ctx = TestContext::new(client).await;

    let record = ctx
        .orchestrator
        .execute(RunRequest::new("7").with_executed_by("alice"))
        .await
        .unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Success));
    assert_eq!(record.artifacts_json(), Some(json!({"x": 1})));
    assert_eq!(record.output.as_deref(), Some("PLAY RECAP ok=3"));
    assert_eq!(record.remote_job_id.as_deref(), Some("1000"));
    assert_eq!(record.executed_by.as_deref(), Some("alice"));
    assert!(record.error_message.is_none());
    assert!(record.error_kind.is_none());
    let completed_at = record.completed_at.expect("terminal run has completed_at");
    assert!(completed_at > record.started_at);
    assert!(record.duration().unwrap() > Duration::ZERO);

    let result: Value = serde_json::from_str(record.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["status"], "successful");

    assert_eq!(ctx.client.status_calls(), 2);
    assert_eq!(ctx.client.artifacts_calls(), 1);
    assert_eq!(ctx.client.output_calls(), 1);
    assert_eq!(ctx.audit_actions(&record.id).await, ["launched", "completed"]);
}

#[tokio::test]
async fn test_launch_rejected() {
    let client = MockRemoteClient::new().with_launch_error(RemoteError::Rejected {
        status: 404,
        detail: "template not found".to_string(),
    });
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("99")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert!(
        record
            .error_message
            .as_deref()
            .unwrap()
            .contains("template not found")
    );
    assert_eq!(record.error_kind.as_deref(), Some("launch_error"));
    assert!(record.remote_job_id.is_none());
    assert!(record.completed_at.is_some());
    assert_eq!(ctx.client.status_calls(), 0);

    let audit = ctx.persistence.list_audit(&record.id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "failed");
    assert_eq!(audit[0].outcome, "launch_error");
}

#[tokio::test]
async fn test_preflight_failure() {
    let ctx = TestContext::new(MockRemoteClient::unreachable()).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert_eq!(record.error_kind.as_deref(), Some("connection_error"));
    assert!(record.remote_job_id.is_none());
    let message = record.error_message.unwrap();
    assert!(message.contains("connection refused"));
    assert!(message.contains("TASKLANE_REMOTE_BASE_URL"));

    assert_eq!(ctx.client.launch_calls(), 0);
    assert_eq!(ctx.audit_actions(&record.id).await, ["failed"]);
}

#[tokio::test]
async fn test_not_configured_remote() {
    let client = MockRemoteClient::new().with_ping_error(RemoteError::NotConfigured(
        "base URL is empty".to_string(),
    ));
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.error_kind.as_deref(), Some("connection_error"));
    assert!(
        record
            .error_message
            .unwrap()
            .contains("TASKLANE_REMOTE_TOKEN")
    );
    assert_eq!(ctx.client.launch_calls(), 0);
}

#[tokio::test]
async fn test_timeout_within_budget() {
    let mut config = fast_config();
    config.poll_interval = Duration::from_millis(50);
    config.poll_timeout = Duration::from_millis(300);
    let ctx = TestContext::with_config(MockRemoteClient::never_completing(), config.clone()).await;

    let started = Instant::now();
    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert_eq!(record.error_kind.as_deref(), Some("timeout"));
    assert_eq!(record.remote_job_id.as_deref(), Some("1000"));
    assert!(record.error_message.unwrap().contains("1000"));
    assert!(
        elapsed < config.poll_timeout + config.poll_interval + Duration::from_millis(250),
        "timed out after {:?}",
        elapsed
    );
    assert!(ctx.client.status_calls() >= 2);
    assert_eq!(ctx.client.artifacts_calls(), 0);
    assert_eq!(ctx.audit_actions(&record.id).await, ["launched", "timed_out"]);
}

#[tokio::test]
async fn test_hanging_status_still_times_out() {
    let mut config = fast_config();
    config.poll_timeout = Duration::from_millis(300);
    config.request_timeout = Duration::from_millis(100);
    let ctx = TestContext::with_config(MockRemoteClient::new().hanging_status(), config).await;

    let record = tokio::time::timeout(
        Duration::from_secs(2),
        ctx.orchestrator.execute(RunRequest::new("7")),
    )
    .await
    .expect("run must not hang")
    .unwrap();

    assert_eq!(record.error_kind.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_transient_poll_errors_are_retried() {
    let client = MockRemoteClient::new()
        .with_status_error(RemoteError::Transient("502 Bad Gateway".to_string()))
        .with_status_error(RemoteError::Transient("connection reset".to_string()))
        .with_final_status(RemoteStatus::Successful);
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Success));
    assert_eq!(ctx.client.status_calls(), 3);
}

#[tokio::test]
async fn test_remote_failure_keeps_explanation() {
    let client = MockRemoteClient::new()
        .with_final_status(RemoteStatus::Failed)
        .with_job_explanation("Task 'deploy' failed on web01");
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert_eq!(record.error_kind.as_deref(), Some("remote_failure"));
    assert_eq!(
        record.error_message.as_deref(),
        Some("Task 'deploy' failed on web01")
    );
    assert!(record.artifacts.is_some());

    let audit = ctx.persistence.list_audit(&record.id).await.unwrap();
    assert_eq!(audit[1].action, "failed");
    assert_eq!(audit[1].outcome, "remote_failure");
}

#[tokio::test]
async fn test_remote_error_status_is_failure() {
    let client = MockRemoteClient::new().with_final_status(RemoteStatus::Error);
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert_eq!(record.error_message.as_deref(), Some("Job failed"));
}

#[tokio::test]
async fn test_remote_cancel_maps_to_canceled() {
    let client = MockRemoteClient::new().with_final_status(RemoteStatus::Canceled);
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Canceled));
    assert_eq!(record.error_kind.as_deref(), Some(ErrorKind::Canceled.as_str()));
    assert_eq!(ctx.audit_actions(&record.id).await, ["launched", "canceled"]);
    assert_eq!(ctx.client.cancel_calls(), 0);
}

#[tokio::test]
async fn test_artifact_failures_do_not_downgrade_success() {
    let client = MockRemoteClient::new()
        .with_artifacts_error(RemoteError::Transient("timeout".to_string()))
        .with_output_error(RemoteError::NotFound("stdout".to_string()));
    let ctx = TestContext::new(client).await;

    let record = ctx.orchestrator.execute(RunRequest::new("7")).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Success));
    assert!(record.artifacts.is_none());
    assert!(record.output.is_none());
    assert!(record.result.is_some());
}

#[tokio::test]
async fn test_template_body_is_rendered() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let request = RunRequest::new("7")
        .with_parameters(params(json!({"host": "web01", "count": 3})))
        .with_body(BodySource::Template(
            r#"{"limit": "{{form.host}}", "extra_vars": {"n": "{{form.count}}", "keep": "{{form.missing}}"}}"#
                .to_string(),
        ));

    let record = ctx.orchestrator.execute(request).await.unwrap();
    assert_eq!(record.run_status(), Some(RunStatus::Success));
    assert_eq!(record.parameters_json(), Some(json!({"host": "web01", "count": 3})));

    let bodies = ctx.client.launched_bodies();
    assert_eq!(
        bodies,
        [json!({"limit": "web01", "extra_vars": {"n": "3", "keep": "{{form.missing}}"}})]
    );
}

#[tokio::test]
async fn test_override_body_is_sent_verbatim() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let request = RunRequest::new("7")
        .with_parameters(params(json!({"host": "web01"})))
        .with_body(BodySource::Override(
            r#"{"limit": "{{form.host}}"}"#.to_string(),
        ));

    ctx.orchestrator.execute(request).await.unwrap();
    assert_eq!(
        ctx.client.launched_bodies(),
        [json!({"limit": "{{form.host}}"})]
    );
}

#[tokio::test]
async fn test_invalid_template_fails_before_launch() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let request = RunRequest::new("7").with_body(BodySource::Template("{not json".to_string()));

    let record = ctx.orchestrator.execute(request).await.unwrap();

    assert_eq!(record.run_status(), Some(RunStatus::Failed));
    assert_eq!(record.error_kind.as_deref(), Some("render_error"));
    assert_eq!(ctx.client.launch_calls(), 0);
    assert_eq!(ctx.audit_actions(&record.id).await, ["failed"]);
}

#[tokio::test]
async fn test_preview_has_no_side_effects() {
    let ctx = TestContext::new(MockRemoteClient::new()).await;
    let request = RunRequest::new("7")
        .with_parameters(params(json!({"host": "web01"})))
        .with_body(BodySource::Template(r#"{"limit": "{{form.host}}"}"#.to_string()));

    let first = ctx.orchestrator.preview_request(&request).unwrap();
    let second = ctx.orchestrator.preview_request(&request).unwrap();

    assert_eq!(first.body, json!({"limit": "web01"}));
    assert_eq!(first.curl, second.curl);
    assert_eq!(first.url, "mock://job_templates/7/launch/");
    assert_eq!(ctx.client.ping_calls(), 0);
    assert_eq!(ctx.client.launch_calls(), 0);
    assert!(
        ctx.persistence
            .list_runs(&ListRunsFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let client = MockRemoteClient::new().with_final_status(RemoteStatus::Successful);
    let ctx = TestContext::new(client).await;

    let mut tickets = Vec::new();
    for _ in 0..10 {
        tickets.push(ctx.orchestrator.submit(RunRequest::new("7")).await.unwrap());
    }

    let mut unique_ids = std::collections::HashSet::new();
    for ticket in tickets {
        let record = ticket.wait().await.unwrap();
        assert_eq!(record.run_status(), Some(RunStatus::Success));
        assert!(unique_ids.insert(record.unique_id));
    }
    assert_eq!(ctx.client.launch_calls(), 10);
    assert!(ctx.orchestrator.in_flight().is_empty());
}
