// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run status and audit vocabulary.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local status of a run.
///
/// `Pending` and `Running` are the only non-terminal states. Once a terminal
/// status is written the row is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, not yet driven.
    Pending,
    /// Launched or about to launch.
    Running,
    /// Remote job reported `successful`.
    Success,
    /// Any failure, including timeouts and interruption.
    Failed,
    /// Canceled by a user or by the remote system.
    Canceled,
}

impl RunStatus {
    /// Statuses that still accept transitions.
    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Action recorded in the audit log. One record per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Launch accepted by the remote system.
    Launched,
    /// Run failed (preflight, render, launch, remote failure, interruption).
    Failed,
    /// Remote job finished successfully.
    Completed,
    /// Poll budget exhausted.
    TimedOut,
    /// Canceled locally or remotely.
    Canceled,
}

impl AuditAction {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launched => "launched",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launched" => Ok(Self::Launched),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "timed_out" => Ok(Self::TimedOut),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown audit action: {}", other)),
        }
    }
}

/// Elapsed time between two timestamps, clamped at zero for clock skew.
pub fn clamped_duration(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Duration {
    (completed_at - started_at).to_std().unwrap_or(Duration::ZERO)
}
