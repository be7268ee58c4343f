// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue items and the queue interface.
//!
//! The queue is an external collaborator: a durable priority queue with
//! leasing, retries, and throttling. The engine only needs [`Queue::enqueue`]
//! with at-most-once semantics per job id; everything else (attempt
//! accounting, retry backoff, fairness) lives in the substrate.
//! [`MemoryQueue`] is the in-memory reference used by tests.

mod memory;

pub use memory::{MemoryQueue, ScheduledItem};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::state::Identifier;

/// Default attempt budget when an item does not carry one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// What a queue item does when picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// First pickup of a run; carries the source edge.
    Start,
    /// A step transition.
    Edge,
    /// The transition taken after a step permanently errored.
    EdgeError,
    /// A sleep wake-up.
    Sleep,
    /// A pause timeout.
    Pause,
}

/// A transition between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Step the run is leaving.
    #[serde(default)]
    pub outgoing: String,
    /// Step the run is entering.
    #[serde(default)]
    pub incoming: String,
    /// For planned steps: the pre-planned step to execute, keyed separately
    /// so memoization does not collide with the discovery step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_generator_step: Option<String>,
}

impl Edge {
    /// The synthetic edge every run starts from.
    pub fn source() -> Edge {
        Edge {
            outgoing: String::new(),
            incoming: veldra_dsl::TRIGGER_STEP.to_string(),
            incoming_generator_step: None,
        }
    }
}

/// Queue item payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// A step transition to execute.
    Edge {
        /// The transition.
        edge: Edge,
    },
    /// A pause timeout firing at the pause's expiry.
    PauseTimeout {
        /// The pause to time out.
        pause_id: Uuid,
        /// Whether the timeout continuation should run only when no event
        /// arrived in time.
        on_timeout: bool,
    },
}

/// Throttle metadata passed through to the queue substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Throttle {
    /// Bucket key: a hash of the function id, optionally suffixed with the
    /// hashed evaluated key expression.
    pub key: String,
    /// Runs allowed per period.
    pub limit: u32,
    /// Additional burst capacity.
    pub burst: u32,
    /// Period in seconds.
    pub period_seconds: u64,
}

/// Delivery timing info provided by the queue substrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    /// Milliseconds between ready time and pickup.
    pub latency_ms: i64,
    /// Milliseconds the item waited due to fairness.
    pub sojourn_ms: i64,
}

/// A queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Idempotency handle: enqueueing a second item with the same job id
    /// fails with [`QueueError::ItemExists`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// History group this item belongs to.
    #[serde(default)]
    pub group_id: String,
    /// Workspace the item belongs to.
    pub workspace_id: Uuid,
    /// What to do on pickup.
    pub kind: Kind,
    /// The run this item belongs to.
    pub identifier: Identifier,
    /// Zero-based attempt counter.
    #[serde(default)]
    pub attempt: u32,
    /// Attempt budget; `None` uses [`DEFAULT_MAX_ATTEMPTS`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// The payload.
    pub payload: Payload,
    /// Throttle metadata, set on start items only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    /// Delivery timing, set by the substrate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_info: Option<RunInfo>,
    /// Opaque metadata (trace carrier).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Item {
    /// The attempt budget for this item.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Whether another attempt is allowed after `attempt` (zero-based) failed.
pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt + 1 < max_attempts
}

/// Queue errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// An item with the same job id was enqueued before.
    #[error("queue item already exists")]
    ItemExists,

    /// Substrate failure.
    #[error("queue error: {0}")]
    Internal(String),
}

/// The queue interface used by the engine.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue an item to run at `at`. Fails with [`QueueError::ItemExists`]
    /// when the item's job id was enqueued before.
    async fn enqueue(&self, item: Item, at: DateTime<Utc>) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_accounting_is_zero_based() {
        // retries=1 => max_attempts=2: attempt 0 retries, attempt 1 does not.
        assert!(should_retry(0, 2));
        assert!(!should_retry(1, 2));
        assert!(!should_retry(0, 1));
    }

    #[test]
    fn source_edge_enters_the_trigger() {
        let edge = Edge::source();
        assert_eq!(edge.incoming, veldra_dsl::TRIGGER_STEP);
        assert!(edge.incoming_generator_step.is_none());
    }
}
