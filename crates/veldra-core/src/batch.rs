// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event batching interface.
//!
//! The batcher is an external collaborator accumulating events per function.
//! The engine appends events and reacts to the result: a new batch schedules
//! a timeout execution, a full batch runs immediately. Materializing a batch
//! into a run goes back through the scheduler with a batch-scoped
//! idempotency key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;
use uuid::Uuid;
use veldra_dsl::Function;

use crate::error::Error;
use crate::event::{Event, TrackedEvent};

/// Outcome of appending an event to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAppendStatus {
    /// Appended to an existing batch.
    Append,
    /// Started a new batch; a timeout execution must be scheduled.
    New,
    /// The batch is full; it must run immediately.
    Full,
}

/// Result of a batch append.
#[derive(Debug, Clone)]
pub struct BatchAppendResult {
    /// What happened.
    pub status: BatchAppendStatus,
    /// The batch id.
    pub batch_id: Ulid,
}

/// An event to append to a function's batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Owning account.
    pub account_id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Owning app.
    pub app_id: Uuid,
    /// The batching function.
    pub function_id: Uuid,
    /// Version of the batching function.
    pub function_version: i32,
    /// Internal id of the event.
    pub event_id: Ulid,
    /// The event.
    pub event: Event,
}

/// Identifies a batch to materialize.
#[derive(Debug, Clone)]
pub struct ScheduleBatchPayload {
    /// The batch.
    pub batch_id: Ulid,
    /// Owning account.
    pub account_id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Owning app.
    pub app_id: Uuid,
    /// The batching function.
    pub function_id: Uuid,
    /// Version of the batching function.
    pub function_version: i32,
}

/// A deferred batch execution.
#[derive(Debug, Clone)]
pub struct ScheduleBatchOpts {
    /// The batch to materialize.
    pub payload: ScheduleBatchPayload,
    /// When to materialize it (the batch timeout).
    pub at: DateTime<Utc>,
}

/// Accumulates events into batches.
#[async_trait]
pub trait Batcher: Send + Sync {
    /// Append an event to the function's open batch.
    async fn append(&self, item: BatchItem, f: &Function) -> Result<BatchAppendResult, Error>;

    /// Schedule a batch-timeout execution.
    async fn schedule_execution(&self, opts: ScheduleBatchOpts) -> Result<(), Error>;

    /// Pull all events of a started batch.
    async fn retrieve_items(&self, batch_id: Ulid) -> Result<Vec<TrackedEvent>, Error>;

    /// Drop batch bookkeeping after the batch was scheduled.
    async fn expire_keys(&self, batch_id: Ulid) -> Result<(), Error>;
}
