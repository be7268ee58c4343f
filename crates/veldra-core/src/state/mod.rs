// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run state: identifiers, metadata, memoized step output, and pauses.
//!
//! The [`StateStore`] trait is the engine's only window onto durable per-run
//! state. Implementations must enforce the idempotency contracts documented
//! on each method; the engine's correctness under retries and concurrent
//! runners depends on them:
//!
//! - [`StateStore::new_run`] rejects duplicate idempotency keys,
//! - [`StateStore::update_metadata`] writes `started_at`/`span_id` at most
//!   once,
//! - [`StateStore::save_response`] rejects duplicate step output,
//! - [`StateStore::save_pause`] rejects duplicate pause ids,
//! - [`StateStore::lease_pause`]/[`StateStore::consume_pause`] let exactly
//!   one caller win a pause.
//!
//! [`MemoryStateStore`] is the in-memory reference backend used by tests and
//! embedders.

mod memory;

pub use memory::MemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use ulid::Ulid;
use uuid::Uuid;

use crate::queue::Edge;

/// Key in run/queue metadata carrying the serialized trace context.
pub const TRACE_CARRIER_KEY: &str = "veldra.trace";

// ============================================================================
// Identifier
// ============================================================================

/// A custom concurrency limit evaluated at schedule time.
///
/// The expression hash is stored alongside the evaluated key so in-flight
/// runs can be re-targeted onto new limit buckets when a later function
/// version changes the expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomConcurrency {
    /// The evaluated, scoped key.
    pub key: String,
    /// Hash of the raw key expression.
    pub hash: String,
    /// The limit bound to this key.
    pub limit: u32,
}

/// Uniquely names a run and everything needed to re-derive its queue jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    /// Function being run.
    pub workflow_id: Uuid,
    /// Version of the function definition.
    pub workflow_version: i32,
    /// The run id. Its embedded timestamp is the run's time reference for
    /// cancellation windows and trace start.
    pub run_id: Ulid,
    /// Internal id of the first triggering event.
    pub event_id: Ulid,
    /// Internal ids of every triggering event (one, or a batch).
    pub event_ids: Vec<Ulid>,
    /// Batch id when the run was triggered by a batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Ulid>,
    /// The original run when this is a rerun.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_run_id: Option<Ulid>,
    /// Replay this run belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_id: Option<Uuid>,
    /// Owning account.
    pub account_id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Owning app.
    pub app_id: Uuid,
    /// Raw idempotency key; see [`Identifier::idempotency_key`].
    pub key: String,
    /// Custom concurrency keys evaluated at schedule time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrency>,
    /// Priority factor evaluated at schedule time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
}

impl Identifier {
    /// The fully-qualified idempotency key, prefixed with the function id so
    /// no invocation can collide across functions.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.key)
    }

    /// The run's creation time, taken from the run id.
    pub fn run_started_at(&self) -> DateTime<Utc> {
        match Utc.timestamp_millis_opt(self.run_id.timestamp_ms() as i64) {
            chrono::LocalResult::Single(dt) => dt,
            _ => Utc::now(),
        }
    }
}

// ============================================================================
// Status & metadata
// ============================================================================

/// Run status. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, not yet picked up.
    Scheduled,
    /// At least one step has started.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a permanent error.
    Failed,
    /// Cancelled by an event, an API call, or a checker.
    Cancelled,
    /// Exceeded the step cap.
    Overflowed,
}

impl Status {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Cancelled | Status::Overflowed
        )
    }

    /// String form, stable for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Scheduled => "scheduled",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Overflowed => "overflowed",
        }
    }
}

/// Per-run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// The run's identifier.
    pub identifier: Identifier,
    /// Current status.
    pub status: Status,
    /// When the first step started. Written at most once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Root span id of the run. Written at most once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// SDK protocol version; `-1` until the first driver response declares it.
    pub request_version: i32,
    /// Set when parallel fan-out requires the SDK to pre-plan steps instead
    /// of executing them inline.
    pub disable_immediate_execution: bool,
    /// Debugger flag.
    pub debugger: bool,
    /// Opaque context blob used for trace propagation.
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// A partial metadata write.
///
/// `started_at` and `span_id` are single-shot: the store ignores them when a
/// value is already present.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    /// Replacement context blob.
    pub context: Map<String, Value>,
    /// New disable-immediate-execution flag.
    pub disable_immediate_execution: bool,
    /// Debugger flag.
    pub debugger: bool,
    /// Root span id; ignored when already set.
    pub span_id: Option<String>,
    /// Start time; ignored when already set.
    pub started_at: Option<DateTime<Utc>>,
    /// Negotiated protocol version.
    pub request_version: i32,
}

// ============================================================================
// Run state
// ============================================================================

/// Input to [`StateStore::new_run`].
#[derive(Debug, Clone)]
pub struct NewRunInput {
    /// The run's identifier.
    pub identifier: Identifier,
    /// Triggering events as JSON maps (one, or a batch).
    pub events: Vec<Value>,
    /// Initial context blob (trace carrier and caller metadata).
    pub context: Map<String, Value>,
    /// Root span id minted at schedule time.
    pub span_id: String,
}

/// A loaded run: metadata, triggering events, and memoized step output.
#[derive(Debug, Clone)]
pub struct RunState {
    metadata: RunMetadata,
    events: Vec<Value>,
    actions: std::collections::HashMap<String, Value>,
    stack: Vec<String>,
}

impl RunState {
    /// Assemble a run state. Intended for state store implementations.
    pub fn new(
        metadata: RunMetadata,
        events: Vec<Value>,
        actions: std::collections::HashMap<String, Value>,
        stack: Vec<String>,
    ) -> Self {
        Self {
            metadata,
            events,
            actions,
            stack,
        }
    }

    /// The run's metadata.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// The run's identifier.
    pub fn identifier(&self) -> &Identifier {
        &self.metadata.identifier
    }

    /// All triggering events.
    pub fn events(&self) -> &[Value] {
        &self.events
    }

    /// The first triggering event.
    pub fn event(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.events.first().unwrap_or(&NULL)
    }

    /// Memoized output for a step, if present.
    pub fn action(&self, step_id: &str) -> Option<&Value> {
        self.actions.get(step_id)
    }

    /// Step ids in write order.
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    /// Number of stored steps.
    pub fn step_count(&self) -> usize {
        self.actions.len()
    }

    /// Data root for evaluating pause expressions against this run.
    pub fn expression_data(&self) -> Value {
        serde_json::json!({ "event": self.event() })
    }
}

// ============================================================================
// Pauses
// ============================================================================

/// A suspended continuation awaiting an event, a timeout, or a cancellation
/// signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pause {
    /// Pause id. Deterministic (UUIDv5 over `run_id + step_id`) for opcode
    /// pauses so re-issuance is idempotent; random v4 for cancellation
    /// pauses.
    pub id: Uuid,
    /// Workspace the pause belongs to.
    pub workspace_id: Uuid,
    /// The suspended run.
    pub identifier: Identifier,
    /// History group the continuation belongs to.
    #[serde(default)]
    pub group_id: String,
    /// Step the run pauses after.
    #[serde(default)]
    pub outgoing: String,
    /// Step the run resumes into.
    #[serde(default)]
    pub incoming: String,
    /// Display name of the pausing step.
    #[serde(default)]
    pub step_name: String,
    /// Opcode that created this pause (wait / invoke), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<String>,
    /// When the pause stops matching and is deleted instead.
    pub expires: DateTime<Utc>,
    /// Only events with this name are considered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Match expression over `async.*` (and interpolated constants).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Pre-filtered expression data: only the attributes the expression
    /// references, captured at save time.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub expression_data: Map<String, Value>,
    /// Where the resume payload lands in run state.
    #[serde(default)]
    pub data_key: String,
    /// Internal id of the event that created the run; never matched, so a
    /// trigger cannot cancel or resume its own run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_event_id: Option<String>,
    /// Correlation id for invocation pauses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoke_correlation_id: Option<String>,
    /// Target function of the invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoke_target_fn_id: Option<String>,
    /// Span id of the invoking step, for trace continuation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_span_id: Option<String>,
    /// Trace start time of the invoking step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_started_at: Option<DateTime<Utc>>,
    /// Whether a match cancels the run instead of resuming it.
    #[serde(default)]
    pub cancel: bool,
    /// Whether this continuation runs only when no event arrived in time.
    #[serde(default)]
    pub on_timeout: bool,
}

impl Pause {
    /// The continuation edge enqueued when this pause resumes.
    pub fn edge(&self) -> Edge {
        Edge {
            outgoing: self.outgoing.clone(),
            incoming: self.incoming.clone(),
            incoming_generator_step: None,
        }
    }

    /// Deterministic pause id for an opcode pause of a run's step.
    pub fn deterministic_id(run_id: Ulid, step_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}{}", run_id, step_id).as_bytes(),
        )
    }

    /// Whether the pause has expired at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }

    /// The data stored into the run (and surfaced to lifecycle observers)
    /// when this pause resumes with `event`.
    ///
    /// The returned `with` value is pre-wrapped in the step-output
    /// discriminator (`data`/`error`).
    pub fn resume_data(&self, event: &Value) -> ResumeData {
        // Invocation pauses resume with the invoked function's result or
        // error, lifted out of the finished event. Waits resume with the
        // matched event itself.
        if self.opcode.as_deref() == Some("InvokeFunction") {
            let data = event.get("data").cloned().unwrap_or(Value::Null);
            let run_id = data
                .get("run_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Ulid::from_string(s).ok());
            let with = match data.get("error") {
                Some(err) if !err.is_null() => serde_json::json!({ "error": err }),
                _ => serde_json::json!({ "data": data.get("result").cloned() }),
            };
            return ResumeData {
                with: Some(with),
                run_id,
                step_name: Some(self.step_name.clone()),
            };
        }

        ResumeData {
            with: Some(serde_json::json!({ "data": event })),
            run_id: None,
            step_name: Some(self.step_name.clone()),
        }
    }
}

/// Data derived from a pause and the matching event at resume time.
#[derive(Debug, Clone, Default)]
pub struct ResumeData {
    /// Wrapped payload stored under the pause's `data_key`.
    pub with: Option<Value>,
    /// Run id of the finishing function, for invocation resumes.
    pub run_id: Option<Ulid>,
    /// Display name of the resumed step.
    pub step_name: Option<String>,
}

// ============================================================================
// Errors & trait
// ============================================================================

/// State store errors. Conflict variants are idempotency sentinels the
/// engine treats as success.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// A run with this idempotency key already exists.
    #[error("identifier already exists")]
    IdentifierExists,

    /// The run does not exist (or was deleted).
    #[error("run not found: {0}")]
    RunNotFound(Ulid),

    /// A pause with this id already exists.
    #[error("pause already exists")]
    PauseAlreadyExists,

    /// The pause is leased by another consumer.
    #[error("pause already leased")]
    PauseLeased,

    /// The pause does not exist (or was already consumed).
    #[error("pause not found")]
    PauseNotFound,

    /// Output for this step was already saved.
    #[error("duplicate response")]
    DuplicateResponse,

    /// Backend failure.
    #[error("state store error during '{operation}': {details}")]
    Internal {
        /// The operation that failed.
        operation: &'static str,
        /// Failure details.
        details: String,
    },
}

/// Durable per-run state plus the pause index.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create state for a new run. Returns [`StateError::IdentifierExists`]
    /// when the identifier's idempotency key was seen before.
    async fn new_run(&self, input: NewRunInput) -> Result<RunState, StateError>;

    /// Load a run.
    async fn load(&self, run_id: Ulid) -> Result<RunState, StateError>;

    /// Whether a run exists and has not been deleted.
    async fn exists(&self, run_id: Ulid) -> Result<bool, StateError>;

    /// Load only a run's metadata.
    async fn metadata(&self, run_id: Ulid) -> Result<RunMetadata, StateError>;

    /// Apply a metadata update. `started_at` and `span_id` are written at
    /// most once; later values are ignored.
    async fn update_metadata(&self, run_id: Ulid, update: MetadataUpdate)
        -> Result<(), StateError>;

    /// Persist step output (a JSON document). Returns
    /// [`StateError::DuplicateResponse`] when output for the step exists.
    async fn save_response(
        &self,
        id: &Identifier,
        step_id: &str,
        output: String,
    ) -> Result<(), StateError>;

    /// Set the run status.
    async fn set_status(&self, id: &Identifier, status: Status) -> Result<(), StateError>;

    /// Mark the run cancelled.
    async fn cancel(&self, id: &Identifier) -> Result<(), StateError>;

    /// Delete run state. Metadata remains readable so terminal status
    /// transitions stay idempotent; [`StateStore::exists`] returns false.
    async fn delete(&self, id: &Identifier) -> Result<(), StateError>;

    /// Persist a pause. Returns [`StateError::PauseAlreadyExists`] for a
    /// duplicate id, which callers treat as success.
    async fn save_pause(&self, pause: Pause) -> Result<(), StateError>;

    /// Lease a pause for consumption. Exactly one concurrent caller wins;
    /// others see [`StateError::PauseLeased`] or
    /// [`StateError::PauseNotFound`].
    async fn lease_pause(&self, id: Uuid) -> Result<(), StateError>;

    /// Consume a pause, storing `with` under the pause's `data_key` and
    /// removing the pause.
    async fn consume_pause(&self, id: Uuid, with: Option<Value>) -> Result<(), StateError>;

    /// Delete a pause without consuming it. Deleting a missing pause is not
    /// an error.
    async fn delete_pause(&self, pause: &Pause) -> Result<(), StateError>;

    /// Load a pause by id.
    async fn pause_by_id(&self, id: Uuid) -> Result<Pause, StateError>;

    /// All pauses subscribed to an event name within a workspace.
    async fn pauses_by_event(
        &self,
        workspace_id: Uuid,
        event_name: &str,
    ) -> Result<Vec<Pause>, StateError>;

    /// Find the invocation pause with the given correlation id.
    async fn pause_by_invoke_correlation(
        &self,
        workspace_id: Uuid,
        correlation_id: &str,
    ) -> Result<Pause, StateError>;
}
