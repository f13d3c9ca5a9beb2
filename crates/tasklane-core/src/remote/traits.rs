// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote job client trait definitions.
//!
//! The orchestrator drives remote jobs through this contract only. Every
//! operation is independently failable.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors from remote job operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// Client has no usable base URL or token.
    #[error("remote job server is not configured: {0}")]
    NotConfigured(String),

    /// Server could not be reached.
    #[error("remote job server unreachable: {0}")]
    Unreachable(String),

    /// Server refused the request.
    #[error("remote job server rejected the request ({status}): {detail}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Remote-provided detail.
        detail: String,
    },

    /// Temporary failure; retrying may succeed.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Job or template does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Response could not be decoded.
    #[error("unexpected response from remote job server: {0}")]
    Decode(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Detail worth preserving on a failed run.
    pub fn detail(&self) -> String {
        match self {
            Self::Rejected { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Status reported by the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteStatus {
    /// Created, not queued.
    New,
    /// Queued.
    Pending,
    /// Waiting on dependencies.
    Waiting,
    /// Executing.
    Running,
    /// Finished successfully.
    Successful,
    /// Finished with failures.
    Failed,
    /// Could not run.
    Error,
    /// Canceled on the remote system.
    Canceled,
    /// Anything else, kept verbatim.
    Unknown(String),
}

impl RemoteStatus {
    /// Parse a remote status string. Never fails.
    pub fn parse(s: &str) -> Self {
        match s {
            "new" => Self::New,
            "pending" => Self::Pending,
            "waiting" => Self::Waiting,
            "running" => Self::Running,
            "successful" => Self::Successful,
            "failed" => Self::Failed,
            "error" => Self::Error,
            "canceled" => Self::Canceled,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Remote representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Unknown(s) => s,
        }
    }

    /// Whether the remote job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Error | Self::Canceled
        )
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchedJob {
    /// Remote handle.
    pub remote_id: String,
    /// Status at launch time.
    pub status: RemoteStatus,
}

/// One status observation of a remote job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Current status.
    pub status: RemoteStatus,
    /// Remote explanation of a failure, if any.
    pub job_explanation: Option<String>,
    /// Remote traceback of a failure, if any.
    pub result_traceback: Option<String>,
    /// Raw remote payload.
    pub raw: Value,
}

impl JobSnapshot {
    /// Snapshot with only a status.
    pub fn with_status(status: RemoteStatus) -> Self {
        let raw = serde_json::json!({ "status": status.as_str() });
        Self {
            status,
            job_explanation: None,
            result_traceback: None,
            raw,
        }
    }

    /// Best available failure message.
    pub fn failure_message(&self) -> Option<&str> {
        self.job_explanation
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.result_traceback.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Where and how a launch would be sent. Used for request previews.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEndpoint {
    /// HTTP method.
    pub method: &'static str,
    /// Full launch URL.
    pub url: String,
    /// Masked credential, never the raw token.
    pub masked_token: Option<String>,
}

/// Remote job execution system.
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Short client name used in logs.
    fn client_type(&self) -> &'static str;

    /// Lightweight connectivity and configuration probe.
    async fn ping(&self) -> Result<()>;

    /// Launch a template with a body.
    async fn launch(&self, template_id: &str, body: &Value) -> Result<LaunchedJob>;

    /// Current status of a job. Network failures are [`RemoteError::Transient`].
    async fn get_status(&self, remote_id: &str) -> Result<JobSnapshot>;

    /// Job stdout as text.
    async fn get_output(&self, remote_id: &str) -> Result<String>;

    /// Job artifacts.
    async fn get_artifacts(&self, remote_id: &str) -> Result<Value>;

    /// Request cancellation of a job.
    async fn cancel(&self, remote_id: &str) -> Result<()>;

    /// Endpoint a launch for this template would hit.
    fn launch_endpoint(&self, template_id: &str) -> LaunchEndpoint;
}
