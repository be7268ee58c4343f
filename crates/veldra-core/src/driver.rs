// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime drivers.
//!
//! A driver executes a single step against a remote user runtime (an HTTP
//! SDK endpoint, a gRPC service, ...) and returns the SDK's response. Drivers
//! are registered once at executor construction, keyed by the runtime type a
//! step's URI scheme selects; duplicate registration fails construction.

use async_trait::async_trait;
use veldra_dsl::Step;
use veldra_protocol::DriverResponse;

use crate::error::Error;
use crate::queue::{Edge, Item};
use crate::state::RunState;

/// Executes steps against a user runtime.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The runtime type this driver serves, matched against
    /// [`Step::runtime_type`].
    fn runtime_type(&self) -> &str;

    /// Execute a step. `state` carries the memoized run so re-entrant SDKs
    /// can skip completed steps; `stack_index` is the position of the step in
    /// the run's stored stack.
    async fn execute(
        &self,
        state: &RunState,
        item: &Item,
        edge: &Edge,
        step: &Step,
        stack_index: usize,
        attempt: u32,
    ) -> Result<DriverResponse, Error>;
}
