// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run id allocation.
//!
//! Identifiers look like `TASK26C0000000042i`:
//!
//! | Part | Example | Meaning |
//! |------|---------|---------|
//! | prefix | `TASK` | literal |
//! | year | `26` | UTC year mod 100 |
//! | pool | `C` | counter shard picked from the actor |
//! | sequence | `0000000042` | post-increment counter, 10 digits |
//! | suffix | `i` | literal |
//!
//! Each `(year, pool)` counter is bumped by a single atomic upsert in the
//! database, so two allocators never observe the same value even across
//! processes. Pools only spread contention; they carry no meaning.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::persistence::Persistence;

/// Literal identifier prefix.
pub const ID_PREFIX: &str = "TASK";

/// Literal identifier suffix.
pub const ID_SUFFIX: &str = "i";

/// Pool alphabet.
pub const POOLS: [char; 5] = ['A', 'B', 'C', 'D', 'E'];

/// Pool used when no hint is available.
pub const DEFAULT_POOL: char = 'A';

/// Digits in the zero-padded sequence.
pub const SEQUENCE_WIDTH: usize = 10;

/// Caller identity used to pick a pool.
///
/// Priority: first group, then user id or email, then the default pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolHint {
    /// Team or group name.
    pub group: Option<String>,
    /// User id or email.
    pub user: Option<String>,
}

impl PoolHint {
    /// Hint from a group name.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            user: None,
        }
    }

    /// Hint from a user id or email.
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            group: None,
            user: Some(user.into()),
        }
    }

    /// The string that decides the pool, if any.
    pub fn key(&self) -> Option<&str> {
        self.group
            .as_deref()
            .filter(|g| !g.is_empty())
            .or_else(|| self.user.as_deref().filter(|u| !u.is_empty()))
    }

    /// Pool this hint maps to.
    pub fn pool(&self) -> char {
        match self.key() {
            Some(key) => pool_for_key(key),
            None => DEFAULT_POOL,
        }
    }
}

/// Map a hint string onto a pool: sum of Unicode scalar values modulo the
/// number of pools. Stable across processes.
pub fn pool_for_key(key: &str) -> char {
    let sum: u64 = key.chars().map(|c| c as u64).sum();
    POOLS[(sum % POOLS.len() as u64) as usize]
}

/// Format an identifier from its parts.
pub fn format_unique_id(year: i32, pool: char, sequence: i64) -> String {
    format!(
        "{}{:02}{}{:0width$}{}",
        ID_PREFIX,
        year.rem_euclid(100),
        pool,
        sequence,
        ID_SUFFIX,
        width = SEQUENCE_WIDTH
    )
}

/// Parsed identifier parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueIdParts {
    /// Two-digit year.
    pub year: u8,
    /// Pool label.
    pub pool: char,
    /// Sequence number.
    pub sequence: u64,
}

/// Parse an identifier produced by [`format_unique_id`].
pub fn parse_unique_id(id: &str) -> Option<UniqueIdParts> {
    let body = id.strip_prefix(ID_PREFIX)?.strip_suffix(ID_SUFFIX)?;
    if body.len() != 2 + 1 + SEQUENCE_WIDTH || !body.is_ascii() {
        return None;
    }

    let (year, rest) = body.split_at(2);
    let (pool, sequence) = rest.split_at(1);
    let pool = pool.chars().next()?;
    if !POOLS.contains(&pool) || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(UniqueIdParts {
        year: year.parse().ok()?,
        pool,
        sequence: sequence.parse().ok()?,
    })
}

/// Source of unique run identifiers.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Allocate a fresh identifier for the given hint.
    async fn allocate(&self, hint: &PoolHint) -> Result<String, CoreError>;

    /// Identifier the next allocation on this hint's pool would produce,
    /// without consuming it. May be stale under concurrency.
    async fn preview(&self, hint: &PoolHint) -> Result<String, CoreError>;
}

/// Per-pool statistics for a year.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool label.
    pub pool: char,
    /// Last issued sequence (0 if unused).
    pub sequence: i64,
    /// Last allocation time.
    pub last_used: Option<chrono::DateTime<Utc>>,
}

/// Counter statistics for a year.
#[derive(Debug, Clone, Serialize)]
pub struct CounterStats {
    /// Calendar year.
    pub year: i32,
    /// One entry per pool, in pool order.
    pub pools: Vec<PoolStats>,
    /// Sum of all pool sequences.
    pub total_allocated: i64,
    /// Runs started in the year.
    pub total_runs: i64,
}

/// Counter statistics for a year, one entry per pool.
pub async fn counter_stats(
    persistence: &dyn Persistence,
    year: i32,
) -> Result<CounterStats, CoreError> {
    let counters = persistence.list_counters(year).await?;
    let total_runs = persistence.count_runs_in_year(year).await?;

    let pools: Vec<PoolStats> = POOLS
        .iter()
        .map(|&pool| {
            let counter = counters
                .iter()
                .find(|c| c.pool.chars().next() == Some(pool));
            PoolStats {
                pool,
                sequence: counter.map(|c| c.sequence).unwrap_or(0),
                last_used: counter.map(|c| c.last_used),
            }
        })
        .collect();

    Ok(CounterStats {
        year,
        total_allocated: pools.iter().map(|p| p.sequence).sum(),
        pools,
        total_runs,
    })
}

/// Allocator backed by the `(year, pool)` counter table.
#[derive(Clone)]
pub struct SequenceAllocator {
    persistence: Arc<dyn Persistence>,
}

impl SequenceAllocator {
    /// Create an allocator over the given store.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Allocate for an explicit year.
    pub async fn allocate_for_year(&self, year: i32, hint: &PoolHint) -> Result<String, CoreError> {
        let pool = hint.pool();
        let sequence = self
            .persistence
            .increment_counter(year, &pool.to_string())
            .await?;

        Ok(format_unique_id(year, pool, sequence))
    }

    /// Preview for an explicit year.
    pub async fn preview_for_year(&self, year: i32, hint: &PoolHint) -> Result<String, CoreError> {
        let pool = hint.pool();
        let current = self
            .persistence
            .get_counter(year, &pool.to_string())
            .await?
            .map(|c| c.sequence)
            .unwrap_or(0);

        Ok(format_unique_id(year, pool, current + 1))
    }
}

#[async_trait]
impl IdAllocator for SequenceAllocator {
    async fn allocate(&self, hint: &PoolHint) -> Result<String, CoreError> {
        self.allocate_for_year(Utc::now().year(), hint).await
    }

    async fn preview(&self, hint: &PoolHint) -> Result<String, CoreError> {
        self.preview_for_year(Utc::now().year(), hint).await
    }
}
