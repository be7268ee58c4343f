// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events: the triggering input of every run and the engine's own internal
//! event vocabulary.
//!
//! The engine emits `veldra/function.finished` (and, for failures,
//! `veldra/function.failed`) when a run ends, and `veldra/function.invoked`
//! when one function invokes another. Invocation correlation ids ride inside
//! event payloads under the reserved `_veldra` key.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;
use uuid::Uuid;

/// Emitted when a run finishes, regardless of outcome.
pub const FN_FINISHED_NAME: &str = "veldra/function.finished";

/// Emitted alongside the finished event when a run fails.
pub const FN_FAILED_NAME: &str = "veldra/function.failed";

/// Emitted to trigger the target of an inter-function invocation.
pub const FN_INVOKED_NAME: &str = "veldra/function.invoked";

/// Reserved key inside event data carrying engine metadata.
pub const EVENT_DATA_PREFIX: &str = "_veldra";

/// Key of the invocation correlation id inside [`EVENT_DATA_PREFIX`].
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// An event as received or emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Caller-supplied event id.
    #[serde(default)]
    pub id: String,

    /// Event name, e.g. `order/created`.
    pub name: String,

    /// Arbitrary event payload.
    #[serde(default)]
    pub data: Value,

    /// Optional user-identifying payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,

    /// Event timestamp in unix milliseconds. Zero means "now".
    #[serde(default)]
    pub ts: i64,
}

impl Event {
    /// The event as a JSON value, for expression data and state storage.
    pub fn map(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The invocation correlation id, when this event carries one.
    pub fn correlation_id(&self) -> Option<String> {
        self.data
            .get(EVENT_DATA_PREFIX)?
            .get(CORRELATION_ID_KEY)?
            .as_str()
            .map(String::from)
    }

    /// The cron schedule for cron-triggered events.
    pub fn cron_schedule(&self) -> Option<String> {
        self.data.get("cron")?.as_str().map(String::from)
    }
}

/// Extract a correlation id from an event rendered as a JSON map.
pub fn correlation_id(event: &Value) -> Option<String> {
    event
        .get("data")?
        .get(EVENT_DATA_PREFIX)?
        .get(CORRELATION_ID_KEY)?
        .as_str()
        .map(String::from)
}

/// An event with its engine-internal identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    /// Engine-assigned id; its timestamp is the event's receive time.
    pub internal_id: Ulid,

    /// Workspace the event belongs to.
    pub workspace_id: Uuid,

    /// The event itself.
    pub event: Event,
}

impl TrackedEvent {
    /// Track a freshly received event, minting its internal id.
    pub fn new(workspace_id: Uuid, event: Event) -> Self {
        Self {
            internal_id: Ulid::new(),
            workspace_id,
            event,
        }
    }
}

/// Options for [`new_invocation_event`].
#[derive(Debug, Clone)]
pub struct NewInvocationEventOpts {
    /// The payload the caller supplied for the invoked function.
    pub payload: Value,

    /// The invoked function's id.
    pub function_id: String,

    /// Correlation id tying the target's finished event back to the caller.
    pub correlation_id: Option<String>,
}

/// Build the event that triggers an invoked function.
pub fn new_invocation_event(opts: NewInvocationEventOpts) -> Event {
    let mut data = match opts.payload {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    };
    data.insert(
        EVENT_DATA_PREFIX.to_string(),
        json!({
            "function_id": opts.function_id,
            CORRELATION_ID_KEY: opts.correlation_id,
        }),
    );

    Event {
        id: Ulid::new().to_string(),
        name: FN_INVOKED_NAME.to_string(),
        data: Value::Object(data),
        user: None,
        ts: Utc::now().timestamp_millis(),
    }
}
