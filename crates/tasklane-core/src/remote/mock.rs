// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock remote client for testing.
//!
//! Plays back a scripted sequence of statuses without talking to a real
//! job server. Every operation can be made to fail or hang.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::traits::*;

/// Scripted behavior.
#[derive(Debug)]
struct MockState {
    ping: Option<RemoteError>,
    launch: Option<RemoteError>,
    statuses: VecDeque<Result<RemoteStatus>>,
    final_status: RemoteStatus,
    job_explanation: Option<String>,
    artifacts: Result<Value>,
    output: Result<String>,
    cancel: Option<RemoteError>,
    hang_status: bool,
    panic_status: bool,
    hang_cancel: bool,
    launch_delay: Option<Duration>,
    launched_bodies: Vec<Value>,
    canceled: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            ping: None,
            launch: None,
            statuses: VecDeque::new(),
            final_status: RemoteStatus::Successful,
            job_explanation: None,
            artifacts: Ok(Value::Object(Default::default())),
            output: Ok(String::new()),
            cancel: None,
            hang_status: false,
            panic_status: false,
            hang_cancel: false,
            launch_delay: None,
            launched_bodies: Vec::new(),
            canceled: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    ping: AtomicUsize,
    launch: AtomicUsize,
    status: AtomicUsize,
    output: AtomicUsize,
    artifacts: AtomicUsize,
    cancel: AtomicUsize,
}

/// Mock remote client for testing.
///
/// Status calls consume the script in order; once it is exhausted every
/// call returns the final status.
#[derive(Debug, Clone, Default)]
pub struct MockRemoteClient {
    state: Arc<Mutex<MockState>>,
    calls: Arc<CallCounters>,
    next_job_id: Arc<AtomicU64>,
}

impl MockRemoteClient {
    /// Mock whose jobs succeed on the first poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock whose preflight probe fails.
    pub fn unreachable() -> Self {
        Self::new().with_ping_error(RemoteError::Unreachable("connection refused".to_string()))
    }

    /// Mock whose jobs never reach a terminal status.
    pub fn never_completing() -> Self {
        Self::new().with_final_status(RemoteStatus::Running)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the preflight probe.
    pub fn with_ping_error(self, err: RemoteError) -> Self {
        self.state().ping = Some(err);
        self
    }

    /// Reject launches.
    pub fn with_launch_error(self, err: RemoteError) -> Self {
        self.state().launch = Some(err);
        self
    }

    /// Statuses returned by successive polls before the final status.
    pub fn with_statuses(self, statuses: impl IntoIterator<Item = RemoteStatus>) -> Self {
        self.state().statuses.extend(statuses.into_iter().map(Ok));
        self
    }

    /// Queue a failing poll.
    pub fn with_status_error(self, err: RemoteError) -> Self {
        self.state().statuses.push_back(Err(err));
        self
    }

    /// Status returned once the script is exhausted.
    pub fn with_final_status(self, status: RemoteStatus) -> Self {
        self.state().final_status = status;
        self
    }

    /// Explanation attached to terminal snapshots.
    pub fn with_job_explanation(self, explanation: impl Into<String>) -> Self {
        self.state().job_explanation = Some(explanation.into());
        self
    }

    /// Artifacts returned after completion.
    pub fn with_artifacts(self, artifacts: Value) -> Self {
        self.state().artifacts = Ok(artifacts);
        self
    }

    /// Fail artifact retrieval.
    pub fn with_artifacts_error(self, err: RemoteError) -> Self {
        self.state().artifacts = Err(err);
        self
    }

    /// Stdout returned after completion.
    pub fn with_output(self, output: impl Into<String>) -> Self {
        self.state().output = Ok(output.into());
        self
    }

    /// Fail stdout retrieval.
    pub fn with_output_error(self, err: RemoteError) -> Self {
        self.state().output = Err(err);
        self
    }

    /// Fail remote cancel.
    pub fn with_cancel_error(self, err: RemoteError) -> Self {
        self.state().cancel = Some(err);
        self
    }

    /// Status calls never return.
    pub fn hanging_status(self) -> Self {
        self.state().hang_status = true;
        self
    }

    /// Status calls panic, taking the calling task down.
    pub fn panicking_status(self) -> Self {
        self.state().panic_status = true;
        self
    }

    /// Launch calls take this long before answering.
    pub fn with_launch_delay(self, delay: Duration) -> Self {
        self.state().launch_delay = Some(delay);
        self
    }

    /// Cancel calls never return.
    pub fn hanging_cancel(self) -> Self {
        self.state().hang_cancel = true;
        self
    }

    /// Number of `ping` calls.
    pub fn ping_calls(&self) -> usize {
        self.calls.ping.load(Ordering::SeqCst)
    }

    /// Number of `launch` calls.
    pub fn launch_calls(&self) -> usize {
        self.calls.launch.load(Ordering::SeqCst)
    }

    /// Number of `get_status` calls.
    pub fn status_calls(&self) -> usize {
        self.calls.status.load(Ordering::SeqCst)
    }

    /// Number of `get_output` calls.
    pub fn output_calls(&self) -> usize {
        self.calls.output.load(Ordering::SeqCst)
    }

    /// Number of `get_artifacts` calls.
    pub fn artifacts_calls(&self) -> usize {
        self.calls.artifacts.load(Ordering::SeqCst)
    }

    /// Number of `cancel` calls.
    pub fn cancel_calls(&self) -> usize {
        self.calls.cancel.load(Ordering::SeqCst)
    }

    /// Bodies passed to `launch`, in order.
    pub fn launched_bodies(&self) -> Vec<Value> {
        self.state().launched_bodies.clone()
    }

    /// Remote ids canceled successfully.
    pub fn canceled_jobs(&self) -> Vec<String> {
        self.state().canceled.clone()
    }
}

#[async_trait]
impl RemoteJobClient for MockRemoteClient {
    fn client_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        self.calls.ping.fetch_add(1, Ordering::SeqCst);
        match &self.state().ping {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn launch(&self, _template_id: &str, body: &Value) -> Result<LaunchedJob> {
        self.calls.launch.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().launch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = &state.launch {
            return Err(err.clone());
        }
        state.launched_bodies.push(body.clone());

        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1000;
        Ok(LaunchedJob {
            remote_id: id.to_string(),
            status: RemoteStatus::Pending,
        })
    }

    async fn get_status(&self, _remote_id: &str) -> Result<JobSnapshot> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);

        let (hang, panics, next) = {
            let mut state = self.state();
            let next = match state.statuses.pop_front() {
                Some(next) => next,
                None => Ok(state.final_status.clone()),
            };
            (
                state.hang_status,
                state.panic_status,
                next.map(|status| (status, state.job_explanation.clone())),
            )
        };

        if panics {
            panic!("scripted status panic");
        }
        if hang {
            std::future::pending::<()>().await;
        }

        let (status, explanation) = next?;
        let mut snapshot = JobSnapshot::with_status(status);
        if snapshot.status.is_terminal() {
            snapshot.job_explanation = explanation;
            if let (Some(explanation), Value::Object(raw)) =
                (&snapshot.job_explanation, &mut snapshot.raw)
            {
                raw.insert(
                    "job_explanation".to_string(),
                    Value::String(explanation.clone()),
                );
            }
        }
        Ok(snapshot)
    }

    async fn get_output(&self, _remote_id: &str) -> Result<String> {
        self.calls.output.fetch_add(1, Ordering::SeqCst);
        self.state().output.clone()
    }

    async fn get_artifacts(&self, _remote_id: &str) -> Result<Value> {
        self.calls.artifacts.fetch_add(1, Ordering::SeqCst);
        self.state().artifacts.clone()
    }

    async fn cancel(&self, remote_id: &str) -> Result<()> {
        self.calls.cancel.fetch_add(1, Ordering::SeqCst);

        let (hang, failure) = {
            let state = self.state();
            (state.hang_cancel, state.cancel.clone())
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        self.state().canceled.push(remote_id.to_string());
        Ok(())
    }

    fn launch_endpoint(&self, template_id: &str) -> LaunchEndpoint {
        LaunchEndpoint {
            method: "POST",
            url: format!("mock://job_templates/{}/launch/", template_id),
            masked_token: None,
        }
    }
}
