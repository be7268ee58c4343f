// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Debounce interface.
//!
//! The debouncer is an external collaborator. When a function has a debounce
//! configuration, schedule requests are forwarded here instead of starting a
//! run; the debouncer later re-enters the scheduler with
//! `prevent_debounce` set.

use async_trait::async_trait;
use ulid::Ulid;
use uuid::Uuid;
use veldra_dsl::Function;

use crate::error::Error;
use crate::event::Event;

/// The event a debounced schedule request carries.
#[derive(Debug, Clone)]
pub struct DebounceItem {
    /// Owning account.
    pub account_id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Owning app.
    pub app_id: Uuid,
    /// The debouncing function.
    pub function_id: Uuid,
    /// Version of the debouncing function.
    pub function_version: i32,
    /// Internal id of the event.
    pub event_id: Ulid,
    /// The event.
    pub event: Event,
}

/// Debounces schedule requests per function key.
#[async_trait]
pub trait Debouncer: Send + Sync {
    /// Record the event against the function's debounce window.
    async fn debounce(&self, item: DebounceItem, f: &Function) -> Result<(), Error>;
}
