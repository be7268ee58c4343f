// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle observers.
//!
//! Observers are notified at well-defined run transitions. Notifications are
//! dispatched on detached tasks so observer side-effects (history writes,
//! pubsub) finish even when the triggering request is cancelled; the engine
//! never awaits them. All methods default to no-ops so listeners implement
//! only what they care about.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;
use veldra_protocol::{DriverResponse, OpcodeInstruction};

use crate::executor::{CancelRequest, ResumeRequest, SkipState};
use crate::queue::{Edge, Item};
use crate::state::Identifier;

/// A sink for run lifecycle transitions.
///
/// Arguments are owned so implementations can move them into their own
/// tasks; the executor clones per listener.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    /// A run was created and its start item enqueued.
    async fn on_function_scheduled(&self, _id: Identifier, _item: Item) {}

    /// The first step of a run started.
    async fn on_function_started(&self, _id: Identifier, _item: Item) {}

    /// A run reached a terminal state (completed or failed).
    async fn on_function_finished(&self, _id: Identifier, _item: Item, _resp: DriverResponse) {}

    /// A run was cancelled.
    async fn on_function_cancelled(&self, _id: Identifier, _req: CancelRequest) {}

    /// A schedule request was skipped because the function is paused.
    async fn on_function_skipped(&self, _id: Identifier, _skip: SkipState) {}

    /// A step is about to be invoked via a driver.
    async fn on_step_started(&self, _id: Identifier, _item: Item, _edge: Edge) {}

    /// A follow-up step (or retry) was enqueued. The step name is `None` for
    /// discovery steps.
    async fn on_step_scheduled(&self, _id: Identifier, _item: Item, _step_name: Option<String>) {}

    /// A driver response was received for a step, success or failure.
    async fn on_step_finished(&self, _id: Identifier, _item: Item, _edge: Edge, _resp: DriverResponse) {
    }

    /// A sleep was scheduled.
    async fn on_sleep(&self, _id: Identifier, _item: Item, _op: OpcodeInstruction, _until: DateTime<Utc>) {
    }

    /// A wait-for-event pause was persisted.
    async fn on_wait_for_event(&self, _id: Identifier, _item: Item, _op: OpcodeInstruction) {}

    /// A wait-for-event pause resumed (event or timeout).
    async fn on_wait_for_event_resumed(&self, _id: Identifier, _req: ResumeRequest, _group_id: String) {
    }

    /// An invocation was published and its pause persisted.
    async fn on_invoke_function(
        &self,
        _id: Identifier,
        _item: Item,
        _op: OpcodeInstruction,
        _event_id: Ulid,
        _correlation_id: String,
    ) {
    }

    /// An invocation pause resumed (target finished or timeout).
    async fn on_invoke_function_resumed(&self, _id: Identifier, _req: ResumeRequest, _group_id: String) {
    }
}
