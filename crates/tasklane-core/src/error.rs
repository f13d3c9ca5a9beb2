// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tasklane-core.
//!
//! Two layers:
//! - [`CoreError`] for the persistence layer, with stable error codes.
//! - [`RunError`] for the run lifecycle, with an [`ErrorKind`] that is
//!   persisted next to the human-readable message of a failed run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors raised by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Another run already holds this unique id.
    UniqueIdConflict {
        /// The conflicting unique id.
        unique_id: String,
    },

    /// Run is in an invalid state for the requested operation.
    InvalidRunState {
        /// The internal run id.
        run_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UniqueIdConflict { .. } => "UNIQUE_ID_CONFLICT",
            Self::InvalidRunState { .. } => "INVALID_RUN_STATE",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error is a unique id collision on insert.
    pub fn is_unique_conflict(&self) -> bool {
        matches!(self, Self::UniqueIdConflict { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UniqueIdConflict { unique_id } => {
                write!(f, "Unique id '{}' is already taken", unique_id)
            }
            Self::InvalidRunState {
                run_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Run '{}' is in invalid state: expected '{}', got '{}'",
                    run_id, expected, actual
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

// ============================================================================
// Run lifecycle errors
// ============================================================================

/// Machine-readable failure category stored in `runs.error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Id allocation or insert retries ran out.
    AllocationExhausted,
    /// Preflight probe failed.
    ConnectionError,
    /// Remote system rejected the launch.
    LaunchError,
    /// A single status poll failed.
    TransientPollError,
    /// Poll budget elapsed without a terminal remote status.
    Timeout,
    /// Request body could not be built.
    RenderError,
    /// Host shut down while the run was in flight.
    Interrupted,
    /// Remote job reached a terminal status other than successful.
    RemoteFailure,
    /// Run was canceled.
    Canceled,
    /// Run does not exist.
    NotFound,
    /// Persistence failure.
    StoreError,
}

impl ErrorKind {
    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllocationExhausted => "allocation_exhausted",
            Self::ConnectionError => "connection_error",
            Self::LaunchError => "launch_error",
            Self::TransientPollError => "transient_poll_error",
            Self::Timeout => "timeout",
            Self::RenderError => "render_error",
            Self::Interrupted => "interrupted",
            Self::RemoteFailure => "remote_failure",
            Self::Canceled => "canceled",
            Self::NotFound => "not_found",
            Self::StoreError => "store_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocation_exhausted" => Ok(Self::AllocationExhausted),
            "connection_error" => Ok(Self::ConnectionError),
            "launch_error" => Ok(Self::LaunchError),
            "transient_poll_error" => Ok(Self::TransientPollError),
            "timeout" => Ok(Self::Timeout),
            "render_error" => Ok(Self::RenderError),
            "interrupted" => Ok(Self::Interrupted),
            "remote_failure" => Ok(Self::RemoteFailure),
            "canceled" => Ok(Self::Canceled),
            "not_found" => Ok(Self::NotFound),
            "store_error" => Ok(Self::StoreError),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// Errors raised while creating or driving a run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
    /// No run was created; the caller should retry later.
    #[error("could not allocate a unique run id after {attempts} attempts: {last_error}")]
    AllocationExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        last_error: String,
    },

    /// Remote system unreachable or not configured at preflight.
    #[error("remote job server is not reachable: {message}")]
    Connection {
        /// What the probe reported.
        message: String,
        /// What the operator should check.
        hint: String,
    },

    /// Remote system rejected the launch.
    #[error("launch failed: {detail}")]
    Launch {
        /// Remote-provided detail, preserved verbatim.
        detail: String,
    },

    /// A single status poll failed.
    #[error("status check for remote job {remote_job_id} failed: {detail}")]
    TransientPoll {
        /// Remote handle being polled.
        remote_job_id: String,
        /// Failure detail.
        detail: String,
    },

    /// Poll budget exhausted.
    #[error(
        "remote job {remote_job_id} did not reach a terminal status within {budget_secs}s; check the remote system for its final state"
    )]
    Timeout {
        /// Remote handle, kept for manual follow-up.
        remote_job_id: String,
        /// The poll budget in seconds.
        budget_secs: u64,
    },

    /// Body template was not valid structured data.
    #[error("failed to build request body: {0}")]
    Render(String),

    /// Remote job ended in a non-successful terminal status.
    #[error("{message}")]
    RemoteFailure {
        /// Remote handle.
        remote_job_id: String,
        /// Remote terminal status.
        status: String,
        /// Remote explanation, or a generic message.
        message: String,
    },

    /// Host shut down while the run was in flight.
    #[error("run interrupted by shutdown{}", remote_suffix(.remote_job_id))]
    Interrupted {
        /// Remote handle if the launch had succeeded.
        remote_job_id: Option<String>,
    },

    /// Run does not exist.
    #[error("run '{run_id}' not found")]
    NotFound {
        /// Internal run id.
        run_id: String,
    },

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] CoreError),
}

fn remote_suffix(remote_job_id: &Option<String>) -> String {
    match remote_job_id {
        Some(id) => format!("; remote job {} may still be running", id),
        None => String::new(),
    }
}

impl RunError {
    /// Machine-readable kind persisted as `error_kind`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationExhausted { .. } => ErrorKind::AllocationExhausted,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::Launch { .. } => ErrorKind::LaunchError,
            Self::TransientPoll { .. } => ErrorKind::TransientPollError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Render(_) => ErrorKind::RenderError,
            Self::RemoteFailure { .. } => ErrorKind::RemoteFailure,
            Self::Interrupted { .. } => ErrorKind::Interrupted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::StoreError,
        }
    }

    /// Operator-facing remediation hint, if any.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { hint, .. } => Some(hint),
            _ => None,
        }
    }

    /// Message stored in `runs.error_message`.
    ///
    /// Connection failures carry their hint so the stored row is actionable
    /// on its own.
    pub fn stored_message(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}. {}", self, hint),
            None => self.to_string(),
        }
    }
}
