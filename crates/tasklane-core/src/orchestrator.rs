// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle orchestration.
//!
//! Each submitted run is driven by its own task:
//!
//! ```text
//! allocate + insert ──► preflight ──► render ──► launch ──► attach handle
//!   (bounded retry)       │             │          │            │
//!                         ▼             ▼          ▼            ▼
//!                      failed        failed     failed     poll loop ──► artifacts + output ──► terminal
//!                 (connection_error) (render)  (launch)       │
//!                                                             ├── budget elapsed ──► failed (timeout)
//!                                                             ├── user cancel ─────► canceled
//!                                                             └── shutdown ────────► failed (interrupted)
//! ```
//!
//! Every terminal write goes through
//! [`Persistence::complete_run_with_audit`], so exactly one writer wins and
//! the winner's status change commits together with its audit record.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Instant, error::Elapsed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::{self, CounterStats, IdAllocator, PoolHint};
use crate::config::OrchestratorConfig;
use crate::error::{CoreError, ErrorKind, RunError};
use crate::persistence::{
    AuditRecord, ListRunsFilter, NewAuditEntry, NewRun, Persistence, RunCompletion, RunRecord,
};
use crate::preview::EquivalentRequest;
use crate::remote::{JobSnapshot, RemoteError, RemoteJobClient, RemoteStatus};
use crate::request::RunRequest;
use crate::run::{AuditAction, RunStatus};

const CANCELED_BY_USER: &str = "Canceled by user";
const CANCELED_REMOTELY: &str = "Job was canceled on the remote system";
const GENERIC_FAILURE: &str = "Job failed";

/// Handle to a submitted run.
pub struct RunTicket {
    /// Internal run id.
    pub run_id: String,
    /// Allocated unique id.
    pub unique_id: String,
    handle: JoinHandle<Result<RunRecord, RunError>>,
    inner: Arc<Inner>,
}

impl fmt::Debug for RunTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTicket")
            .field("run_id", &self.run_id)
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

impl RunTicket {
    /// Wait for the run to reach a terminal status.
    ///
    /// If the run task died, the run is marked `failed` with kind
    /// `interrupted` before the error is returned.
    pub async fn wait(self) -> Result<RunRecord, RunError> {
        let e = match self.handle.await {
            Ok(result) => return result,
            Err(e) => e,
        };
        error!(run_id = %self.run_id, unique_id = %self.unique_id, error = %e, "Run task aborted");

        if let Some(control) = self.inner.registry().remove(&self.run_id) {
            control.done.cancel();
        }

        let remote_job_id = match self.inner.persistence.get_run(&self.run_id).await {
            Ok(record) => record.and_then(|r| r.remote_job_id),
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "Failed to load aborted run");
                None
            }
        };
        let run = RunRef {
            id: self.run_id.clone(),
            unique_id: self.unique_id.clone(),
        };
        let err = RunError::Interrupted {
            remote_job_id: remote_job_id.clone(),
        };
        if let Err(write_err) = self.inner.fail(&run, &err, remote_job_id.as_deref()).await {
            warn!(run_id = %self.run_id, error = %write_err, "Failed to record aborted run");
        }
        Err(err)
    }
}

/// Per-run signals shared between the run task and `cancel`/`shutdown`.
#[derive(Clone)]
struct RunControl {
    /// Set by a user cancel.
    cancel: CancellationToken,
    /// Set by the run task once its terminal write is done.
    done: CancellationToken,
}

#[derive(Debug, Clone)]
struct RunRef {
    id: String,
    unique_id: String,
}

impl From<&RunRecord> for RunRef {
    fn from(record: &RunRecord) -> Self {
        Self {
            id: record.id.clone(),
            unique_id: record.unique_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Canceled,
    Shutdown,
}

enum PollOutcome {
    Terminal(JobSnapshot),
    TimedOut,
    Interrupted(Interrupt),
}

struct Inner {
    persistence: Arc<dyn Persistence>,
    allocator: Arc<dyn IdAllocator>,
    client: Arc<dyn RemoteJobClient>,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
    in_flight: Mutex<HashMap<String, RunControl>>,
}

/// Drives runs from creation to a terminal status.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        allocator: Arc<dyn IdAllocator>,
        client: Arc<dyn RemoteJobClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                persistence,
                allocator,
                client,
                config,
                shutdown: CancellationToken::new(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create the run row and spawn the task that drives it.
    ///
    /// Fails without creating anything when no unique id could be
    /// allocated and inserted.
    pub async fn submit(&self, request: RunRequest) -> Result<RunTicket, RunError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RunError::Interrupted {
                remote_job_id: None,
            });
        }

        let run = self.inner.create_run(&request).await?;
        info!(
            run_id = %run.id,
            unique_id = %run.unique_id,
            template_id = %request.template_id,
            "Run created"
        );

        let control = RunControl {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        self.inner
            .registry()
            .insert(run.id.clone(), control.clone());

        let inner = self.inner.clone();
        let task_run = run.clone();
        let handle = tokio::spawn(async move {
            let result = inner.drive(&task_run, &request, &control).await;
            inner.registry().remove(&task_run.id);
            control.done.cancel();

            match result {
                Ok(()) => inner.load(&task_run.id).await,
                Err(e) => {
                    error!(
                        run_id = %task_run.id,
                        unique_id = %task_run.unique_id,
                        error = %e,
                        "Run orchestration failed"
                    );
                    Err(e)
                }
            }
        });

        Ok(RunTicket {
            run_id: run.id,
            unique_id: run.unique_id,
            handle,
            inner: self.inner.clone(),
        })
    }

    /// Submit a run and wait for its terminal row.
    pub async fn execute(&self, request: RunRequest) -> Result<RunRecord, RunError> {
        self.submit(request).await?.wait().await
    }

    /// Cancel a run.
    ///
    /// Attempts a remote cancel bounded by `cancel_timeout`, then marks the
    /// run `canceled` regardless of the remote outcome. Works for runs not
    /// driven by this process as long as the row is not terminal.
    pub async fn cancel(&self, run_id: &str) -> Result<RunRecord, RunError> {
        let record = self.inner.load(run_id).await?;
        if record.is_terminal() {
            return Err(CoreError::InvalidRunState {
                run_id: run_id.to_string(),
                expected: "pending or running".to_string(),
                actual: record.status,
            }
            .into());
        }

        let control = self.inner.registry().get(run_id).cloned();
        match control {
            Some(control) => {
                info!(run_id = %run_id, unique_id = %record.unique_id, "Cancel requested for in-flight run");
                control.cancel.cancel();

                let wait = self.inner.config.request_timeout
                    + self.inner.config.cancel_timeout
                    + Duration::from_secs(1);
                if tokio::time::timeout(wait, control.done.cancelled())
                    .await
                    .is_err()
                {
                    warn!(run_id = %run_id, "Run task did not stop in time, canceling directly");
                    let current = self.inner.load(run_id).await?;
                    self.inner
                        .finish_canceled(
                            &RunRef::from(&current),
                            current.remote_job_id.as_deref(),
                            CANCELED_BY_USER,
                        )
                        .await?;
                }
            }
            None => {
                info!(run_id = %run_id, unique_id = %record.unique_id, "Cancel requested for run not driven by this process");
                self.inner
                    .finish_canceled(
                        &RunRef::from(&record),
                        record.remote_job_id.as_deref(),
                        CANCELED_BY_USER,
                    )
                    .await?;
            }
        }

        self.inner.load(run_id).await
    }

    /// Stop every in-flight run.
    ///
    /// Poll loops stop making remote calls; their runs are marked `failed`
    /// with kind `interrupted`. New submissions are refused afterwards.
    pub async fn shutdown(&self) {
        let controls: Vec<RunControl> = self.inner.registry().values().cloned().collect();
        info!(in_flight = controls.len(), "Shutting down run orchestrator");
        self.inner.shutdown.cancel();

        let deadline = Instant::now() + self.inner.config.request_timeout;
        for control in controls {
            if tokio::time::timeout_at(deadline, control.done.cancelled())
                .await
                .is_err()
            {
                warn!("Timed out waiting for in-flight runs to stop");
                break;
            }
        }
    }

    /// Render the launch request a submission would send. No remote call,
    /// no write.
    pub fn preview_request(&self, request: &RunRequest) -> Result<EquivalentRequest, RunError> {
        let body = request.build_body()?;
        let endpoint = self.inner.client.launch_endpoint(&request.template_id);
        Ok(EquivalentRequest::new(endpoint, body))
    }

    /// Identifier the next allocation for this hint would produce.
    pub async fn next_id_preview(&self, hint: &PoolHint) -> Result<String, RunError> {
        Ok(self.inner.allocator.preview(hint).await?)
    }

    /// Per-pool counter statistics for a year.
    pub async fn counter_stats(&self, year: i32) -> Result<CounterStats, RunError> {
        Ok(allocator::counter_stats(self.inner.persistence.as_ref(), year).await?)
    }

    /// Fetch a run.
    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, RunError> {
        self.inner.load(run_id).await
    }

    /// List runs, newest first.
    pub async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, RunError> {
        Ok(self.inner.persistence.list_runs(filter).await?)
    }

    /// Audit trail of a run, oldest first.
    pub async fn audit_log(&self, run_id: &str) -> Result<Vec<AuditRecord>, RunError> {
        Ok(self.inner.persistence.list_audit(run_id).await?)
    }

    /// Ids of runs currently driven by this orchestrator.
    pub fn in_flight(&self) -> Vec<String> {
        self.inner.registry().keys().cloned().collect()
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, HashMap<String, RunControl>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn load(&self, run_id: &str) -> Result<RunRecord, RunError> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    // ========================================================================
    // Creation
    // ========================================================================

    async fn create_run(&self, request: &RunRequest) -> Result<RunRef, RunError> {
        let hint = request.actor.pool_hint();
        let parameters =
            serde_json::to_string(&request.parameters).map_err(CoreError::from)?;
        let max_attempts = self.config.max_insert_attempts.max(1);

        let mut reserved = request.reserved_unique_id.clone();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let unique_id = match reserved.take() {
                Some(id) => id,
                None => match self.allocator.allocate(&hint).await {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(attempt, error = %e, "Unique id allocation failed");
                        last_error = e.to_string();
                        self.backoff(attempt, max_attempts).await;
                        continue;
                    }
                },
            };

            let run = NewRun {
                id: Uuid::new_v4().to_string(),
                unique_id,
                template_id: request.template_id.clone(),
                status: RunStatus::Running,
                parameters: parameters.clone(),
                executed_by: request.executed_by_label(),
                started_at: chrono::Utc::now(),
            };

            match self.persistence.insert_run(&run).await {
                Ok(()) => {
                    return Ok(RunRef {
                        id: run.id,
                        unique_id: run.unique_id,
                    });
                }
                Err(e) if e.is_unique_conflict() => {
                    warn!(
                        attempt,
                        unique_id = %run.unique_id,
                        "Unique id already taken, allocating a fresh one"
                    );
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }

            self.backoff(attempt, max_attempts).await;
        }

        Err(RunError::AllocationExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn backoff(&self, attempt: u32, max_attempts: u32) {
        if attempt < max_attempts {
            tokio::time::sleep(backoff_delay(self.config.retry_backoff_base, attempt)).await;
        }
    }

    // ========================================================================
    // Driving
    // ========================================================================

    async fn drive(
        &self,
        run: &RunRef,
        request: &RunRequest,
        control: &RunControl,
    ) -> Result<(), RunError> {
        // Preflight
        match self
            .guarded(control, self.config.preflight_timeout, self.client.ping())
            .await
        {
            Err(interrupt) => return self.interrupted(run, interrupt, None).await,
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => {
                let err = RunError::Connection {
                    message: e.to_string(),
                    hint: remediation_hint(&e),
                };
                return self.fail(run, &err, None).await;
            }
            Ok(None) => {
                let err = RunError::Connection {
                    message: format!(
                        "no answer from {} within {:?}",
                        self.client.client_type(),
                        self.config.preflight_timeout
                    ),
                    hint: "Check network connectivity between this host and the remote job server"
                        .to_string(),
                };
                return self.fail(run, &err, None).await;
            }
        }

        let body = match request.build_body() {
            Ok(body) => body,
            Err(err) => return self.fail(run, &err, None).await,
        };

        if let Some(interrupt) = self.pending_interrupt(control) {
            return self.interrupted(run, interrupt, None).await;
        }

        // Launch is not interruptible: dropping it mid-flight could orphan a remote job.
        let launched = match tokio::time::timeout(
            self.config.request_timeout,
            self.client.launch(&request.template_id, &body),
        )
        .await
        {
            Ok(Ok(job)) => job,
            Ok(Err(e)) => {
                let err = RunError::Launch { detail: e.detail() };
                return self.fail(run, &err, None).await;
            }
            Err(_) => {
                let err = RunError::Launch {
                    detail: format!(
                        "launch request timed out after {:?}",
                        self.config.request_timeout
                    ),
                };
                return self.fail(run, &err, None).await;
            }
        };
        let remote_job_id = launched.remote_id;

        let entry = audit_entry(
            run,
            AuditAction::Launched,
            "success",
            json!({
                "template_id": request.template_id,
                "remote_job_id": remote_job_id,
            }),
        );
        match self
            .persistence
            .attach_remote_job_with_audit(&run.id, &remote_job_id, &entry)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    run_id = %run.id,
                    unique_id = %run.unique_id,
                    remote_job_id = %remote_job_id,
                    "Run became terminal during launch, canceling remote job"
                );
                self.cancel_remote(run, Some(&remote_job_id)).await;
                return Ok(());
            }
            Err(e) => {
                error!(
                    run_id = %run.id,
                    unique_id = %run.unique_id,
                    remote_job_id = %remote_job_id,
                    error = %e,
                    "Failed to record remote job, canceling it"
                );
                self.cancel_remote(run, Some(&remote_job_id)).await;
                return self.fail(run, &RunError::Store(e), Some(&remote_job_id)).await;
            }
        }

        info!(
            run_id = %run.id,
            unique_id = %run.unique_id,
            remote_job_id = %remote_job_id,
            remote_status = %launched.status,
            "Remote job launched"
        );

        match self.poll(run, &remote_job_id, control).await {
            PollOutcome::Terminal(snapshot) => self.reconcile(run, &remote_job_id, snapshot).await,
            PollOutcome::TimedOut => {
                let err = RunError::Timeout {
                    remote_job_id: remote_job_id.clone(),
                    budget_secs: self.config.poll_timeout.as_secs(),
                };
                self.fail(run, &err, Some(&remote_job_id)).await
            }
            PollOutcome::Interrupted(interrupt) => {
                self.interrupted(run, interrupt, Some(&remote_job_id)).await
            }
        }
    }

    async fn poll(&self, run: &RunRef, remote_job_id: &str, control: &RunControl) -> PollOutcome {
        let deadline = Instant::now() + self.config.poll_timeout;
        let mut attempt: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return PollOutcome::TimedOut;
            }

            attempt += 1;
            let budget = self.config.request_timeout.min(remaining);
            match self
                .guarded(control, budget, self.client.get_status(remote_job_id))
                .await
            {
                Err(interrupt) => return PollOutcome::Interrupted(interrupt),
                Ok(Some(Ok(snapshot))) if snapshot.status.is_terminal() => {
                    debug!(
                        run_id = %run.id,
                        remote_job_id = %remote_job_id,
                        status = %snapshot.status,
                        attempt,
                        "Remote job reached terminal status"
                    );
                    return PollOutcome::Terminal(snapshot);
                }
                Ok(Some(Ok(snapshot))) => {
                    debug!(
                        run_id = %run.id,
                        remote_job_id = %remote_job_id,
                        status = %snapshot.status,
                        attempt,
                        "Remote job still active"
                    );
                }
                Ok(Some(Err(e))) => {
                    let err = RunError::TransientPoll {
                        remote_job_id: remote_job_id.to_string(),
                        detail: e.to_string(),
                    };
                    warn!(run_id = %run.id, unique_id = %run.unique_id, attempt, error = %err, "Status poll failed, retrying");
                }
                Ok(None) => {
                    warn!(
                        run_id = %run.id,
                        unique_id = %run.unique_id,
                        remote_job_id = %remote_job_id,
                        attempt,
                        "Status poll timed out, retrying"
                    );
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return PollOutcome::TimedOut;
            }
            if let Some(interrupt) = self
                .sleep(control, self.config.poll_interval.min(remaining))
                .await
            {
                return PollOutcome::Interrupted(interrupt);
            }
        }
    }

    async fn reconcile(
        &self,
        run: &RunRef,
        remote_job_id: &str,
        snapshot: JobSnapshot,
    ) -> Result<(), RunError> {
        let budget = self.config.request_timeout;
        let (artifacts, output) = tokio::join!(
            tokio::time::timeout(budget, self.client.get_artifacts(remote_job_id)),
            tokio::time::timeout(budget, self.client.get_output(remote_job_id)),
        );
        let artifacts = best_effort(run, remote_job_id, "artifacts", artifacts);
        let output = best_effort(run, remote_job_id, "output", output);

        let (status, action, outcome, failure) = match &snapshot.status {
            RemoteStatus::Successful => (RunStatus::Success, AuditAction::Completed, "success", None),
            RemoteStatus::Canceled => (
                RunStatus::Canceled,
                AuditAction::Canceled,
                "canceled",
                Some((CANCELED_REMOTELY.to_string(), ErrorKind::Canceled)),
            ),
            other => {
                let err = RunError::RemoteFailure {
                    remote_job_id: remote_job_id.to_string(),
                    status: other.to_string(),
                    message: snapshot
                        .failure_message()
                        .unwrap_or(GENERIC_FAILURE)
                        .to_string(),
                };
                (
                    RunStatus::Failed,
                    AuditAction::Failed,
                    ErrorKind::RemoteFailure.as_str(),
                    Some((err.stored_message(), err.kind())),
                )
            }
        };

        let mut completion = RunCompletion::new(status);
        completion.result = Some(snapshot.raw.to_string());
        completion.artifacts = artifacts.map(|a| a.to_string());
        completion.output = output;
        if let Some((message, kind)) = &failure {
            completion.error_message = Some(message.clone());
            completion.error_kind = Some(kind.to_string());
        }

        let applied = self
            .complete(
                run,
                &completion,
                action,
                outcome,
                json!({
                    "remote_job_id": remote_job_id,
                    "remote_status": snapshot.status.as_str(),
                    "message": failure.as_ref().map(|(m, _)| m),
                }),
            )
            .await?;

        if applied {
            info!(
                run_id = %run.id,
                unique_id = %run.unique_id,
                remote_job_id = %remote_job_id,
                status = %status,
                "Run finished"
            );
        }
        Ok(())
    }

    // ========================================================================
    // Terminal writes
    // ========================================================================

    async fn fail(
        &self,
        run: &RunRef,
        err: &RunError,
        remote_job_id: Option<&str>,
    ) -> Result<(), RunError> {
        let kind = err.kind();
        warn!(
            run_id = %run.id,
            unique_id = %run.unique_id,
            remote_job_id = ?remote_job_id,
            error_kind = %kind,
            error = %err,
            "Run failed"
        );

        let mut completion = RunCompletion::new(RunStatus::Failed);
        completion.error_message = Some(err.stored_message());
        completion.error_kind = Some(kind.to_string());

        let action = match err {
            RunError::Timeout { .. } => AuditAction::TimedOut,
            _ => AuditAction::Failed,
        };
        let detail = json!({
            "error_kind": kind,
            "message": err.to_string(),
            "hint": err.hint(),
            "remote_job_id": remote_job_id,
        });

        self.complete(run, &completion, action, kind.as_str(), detail)
            .await
            .map(|_| ())
    }

    /// Best-effort remote cancel bounded by `cancel_timeout`. Returns the
    /// outcome as recorded in the audit detail.
    async fn cancel_remote(&self, run: &RunRef, remote_job_id: Option<&str>) -> String {
        let Some(id) = remote_job_id else {
            return "skipped".to_string();
        };
        match tokio::time::timeout(self.config.cancel_timeout, self.client.cancel(id)).await {
            Ok(Ok(())) => {
                debug!(run_id = %run.id, remote_job_id = %id, "Remote job canceled");
                "canceled".to_string()
            }
            Ok(Err(e)) => {
                warn!(run_id = %run.id, remote_job_id = %id, error = %e, "Remote cancel failed");
                format!("failed: {}", e)
            }
            Err(_) => {
                warn!(
                    run_id = %run.id,
                    remote_job_id = %id,
                    timeout = ?self.config.cancel_timeout,
                    "Remote cancel timed out"
                );
                format!("timed out after {:?}", self.config.cancel_timeout)
            }
        }
    }

    async fn finish_canceled(
        &self,
        run: &RunRef,
        remote_job_id: Option<&str>,
        reason: &str,
    ) -> Result<bool, RunError> {
        let remote_cancel = self.cancel_remote(run, remote_job_id).await;

        let mut completion = RunCompletion::new(RunStatus::Canceled);
        completion.error_message = Some(reason.to_string());
        completion.error_kind = Some(ErrorKind::Canceled.to_string());

        let applied = self
            .complete(
                run,
                &completion,
                AuditAction::Canceled,
                "canceled",
                json!({
                    "reason": reason,
                    "remote_job_id": remote_job_id,
                    "remote_cancel": remote_cancel,
                }),
            )
            .await?;

        if applied {
            info!(run_id = %run.id, unique_id = %run.unique_id, remote_cancel = %remote_cancel, "Run canceled");
        }
        Ok(applied)
    }

    async fn interrupted(
        &self,
        run: &RunRef,
        interrupt: Interrupt,
        remote_job_id: Option<&str>,
    ) -> Result<(), RunError> {
        match interrupt {
            Interrupt::Canceled => self
                .finish_canceled(run, remote_job_id, CANCELED_BY_USER)
                .await
                .map(|_| ()),
            Interrupt::Shutdown => {
                let err = RunError::Interrupted {
                    remote_job_id: remote_job_id.map(str::to_string),
                };
                self.fail(run, &err, remote_job_id).await
            }
        }
    }

    /// Guarded terminal write plus its audit record, in one transaction.
    async fn complete(
        &self,
        run: &RunRef,
        completion: &RunCompletion,
        action: AuditAction,
        outcome: &str,
        detail: Value,
    ) -> Result<bool, RunError> {
        let entry = audit_entry(run, action, outcome, detail);
        let applied = self
            .persistence
            .complete_run_with_audit(&run.id, completion, &entry)
            .await
            .map_err(|e| {
                error!(
                    run_id = %run.id,
                    status = %completion.status,
                    action = %action,
                    error = %e,
                    "Failed to write terminal status"
                );
                RunError::from(e)
            })?;

        if !applied {
            debug!(
                run_id = %run.id,
                status = %completion.status,
                "Run already terminal, skipping write"
            );
        }
        Ok(applied)
    }

    // ========================================================================
    // Cancellation helpers
    // ========================================================================

    fn pending_interrupt(&self, control: &RunControl) -> Option<Interrupt> {
        if control.cancel.is_cancelled() {
            Some(Interrupt::Canceled)
        } else if self.shutdown.is_cancelled() {
            Some(Interrupt::Shutdown)
        } else {
            None
        }
    }

    /// Run `fut` with a time budget, stopping early on cancel or shutdown.
    /// `Ok(None)` means the budget elapsed.
    async fn guarded<T>(
        &self,
        control: &RunControl,
        budget: Duration,
        fut: impl Future<Output = T>,
    ) -> Result<Option<T>, Interrupt> {
        tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Err(Interrupt::Canceled),
            _ = self.shutdown.cancelled() => Err(Interrupt::Shutdown),
            res = tokio::time::timeout(budget, fut) => Ok(res.ok()),
        }
    }

    async fn sleep(&self, control: &RunControl, duration: Duration) -> Option<Interrupt> {
        tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Some(Interrupt::Canceled),
            _ = self.shutdown.cancelled() => Some(Interrupt::Shutdown),
            _ = tokio::time::sleep(duration) => None,
        }
    }
}

fn audit_entry(run: &RunRef, action: AuditAction, outcome: &str, detail: Value) -> NewAuditEntry {
    NewAuditEntry {
        run_id: run.id.clone(),
        unique_id: run.unique_id.clone(),
        action,
        outcome: outcome.to_string(),
        detail: Some(detail),
    }
}

fn best_effort<T>(
    run: &RunRef,
    remote_job_id: &str,
    what: &str,
    result: Result<Result<T, RemoteError>, Elapsed>,
) -> Option<T> {
    match result {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(run_id = %run.id, remote_job_id = %remote_job_id, error = %e, "Failed to fetch {}", what);
            None
        }
        Err(_) => {
            warn!(run_id = %run.id, remote_job_id = %remote_job_id, "Timed out fetching {}", what);
            None
        }
    }
}

fn remediation_hint(err: &RemoteError) -> String {
    match err {
        RemoteError::NotConfigured(_) => {
            "Configure the remote job server: set TASKLANE_REMOTE_BASE_URL and TASKLANE_REMOTE_TOKEN"
                .to_string()
        }
        RemoteError::Rejected {
            status: 401 | 403, ..
        } => "Check that TASKLANE_REMOTE_TOKEN is valid and allowed to launch jobs".to_string(),
        _ => "Check that TASKLANE_REMOTE_BASE_URL is correct and the server is reachable from this host"
            .to_string(),
    }
}

/// Linear backoff with jitter: `base * attempt + rand(0..=base)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(base_ms * attempt as u64 + jitter)
}
