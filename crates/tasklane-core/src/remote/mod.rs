// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote job clients.
//!
//! [`RemoteJobClient`] is the contract the orchestrator drives. Adapters:
//! - [`AwxClient`]: AWX-compatible REST API (feature `awx`)
//! - [`MockRemoteClient`]: scripted in-process client for tests

#[cfg(feature = "awx")]
pub mod awx;
pub mod mock;
mod traits;

#[cfg(feature = "awx")]
pub use awx::{AwxClient, AwxConfig};
pub use mock::MockRemoteClient;
pub use traits::*;
