// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Veldra DSL - function definition types.
//!
//! A [`Function`] describes everything the engine needs to know about a user
//! function before running it: its steps, triggers, and the flow-control
//! configuration (cancellation, debounce, throttle, batching, concurrency,
//! priority) evaluated at schedule time.
//!
//! These types are the single source of truth for function configuration and
//! are serde round-trippable; the engine never mutates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the synthetic step every run starts from. The scheduler enqueues
/// the source edge pointing at this step; the executor rewrites it to the
/// function's sole user step on first pickup.
pub const TRIGGER_STEP: &str = "$trigger";

/// Default number of retries for a step when the definition does not set one.
pub const DEFAULT_STEP_RETRIES: u32 = 3;

// ============================================================================
// Function
// ============================================================================

/// A complete function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Stable identifier of the function across versions.
    pub id: Uuid,

    /// Human-readable slug, unique within an app.
    pub slug: String,

    /// Version of this function definition.
    #[serde(default)]
    pub version: i32,

    /// The function's steps. The engine currently requires exactly one
    /// entrypoint step; fan-out happens through the opcode protocol, not
    /// through multi-step definitions.
    pub steps: Vec<Step>,

    /// What causes this function to run.
    #[serde(default)]
    pub triggers: Vec<Trigger>,

    /// Events that cancel an in-progress run.
    #[serde(default)]
    pub cancel: Vec<CancelDefinition>,

    /// Debounce configuration. When set, schedule requests are forwarded to
    /// the debouncer instead of starting a run immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce: Option<Debounce>,

    /// Throttle configuration applied to the initial enqueue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,

    /// Event batching configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_batch: Option<EventBatchConfig>,

    /// Concurrency limits, including custom keyed limits evaluated against
    /// the triggering event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyLimits>,

    /// Priority configuration evaluated against the triggering event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl Function {
    /// Returns the function's slug.
    pub fn get_slug(&self) -> &str {
        &self.slug
    }
}

// ============================================================================
// Steps
// ============================================================================

/// A single step of a function.
///
/// The URI addresses the user's SDK; its scheme selects the runtime driver
/// used to invoke it (e.g. `http://...` is executed by the HTTP driver).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable step identifier, referenced by stored state and queue edges.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Address of the user code backing this step.
    pub uri: String,

    /// Number of retries after the first attempt. `None` uses
    /// [`DEFAULT_STEP_RETRIES`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl Step {
    /// The runtime type used to select a driver, taken from the URI scheme.
    pub fn runtime_type(&self) -> &str {
        match self.uri.split_once("://") {
            Some((scheme, _)) => scheme,
            None => self.uri.as_str(),
        }
    }

    /// Retry count for this step.
    pub fn retry_count(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_STEP_RETRIES)
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// What causes a function to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Run when a matching event is received.
    Event(EventTrigger),
    /// Run on a cron schedule.
    Cron(CronTrigger),
}

/// An event trigger with an optional match expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTrigger {
    /// Name of the triggering event.
    pub event: String,

    /// Optional expression the event must satisfy.
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// A cron trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTrigger {
    /// Cron schedule, e.g. `0 * * * *`.
    pub cron: String,
}

// ============================================================================
// Flow control
// ============================================================================

/// Declares that an event cancels in-progress runs of this function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelDefinition {
    /// Name of the cancelling event.
    pub event: String,

    /// How long after scheduling the cancellation stays armed, as a duration
    /// string (`"30m"`, `"24h"`). `None` uses the engine default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Optional expression relating the cancelling event to the triggering
    /// event, e.g. `event.data.order_id == async.data.order_id`.
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Debounce configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debounce {
    /// Optional expression producing the debounce key from the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Debounce period as a duration string.
    pub period: String,
}

/// Throttle configuration applied when the run is first enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Throttle {
    /// Optional expression producing a throttle key from the event. Runs with
    /// distinct keys consume separate throttle buckets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Number of runs allowed per period.
    pub limit: u32,

    /// Additional burst capacity.
    #[serde(default)]
    pub burst: u32,

    /// Throttle period in seconds.
    pub period_seconds: u64,
}

/// Event batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchConfig {
    /// Number of events that completes a batch.
    pub max_size: usize,

    /// How long a partial batch waits before running, as a duration string.
    pub timeout: String,
}

// ============================================================================
// Concurrency & priority
// ============================================================================

/// The scope a concurrency limit binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Limit applies per function.
    #[default]
    Function,
    /// Limit applies across the whole account.
    Account,
    /// Limit applies across the environment (workspace).
    Env,
}

/// A set of concurrency limits for a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// The individual limits. At most one may be un-keyed.
    pub limits: Vec<ConcurrencyLimit>,
}

/// A single concurrency limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    /// Scope the limit binds to.
    #[serde(default)]
    pub scope: ConcurrencyScope,

    /// Optional expression producing the limit key from the event. Limits
    /// with a key are "custom" limits and are evaluated at schedule time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Maximum number of concurrent runs within this bucket.
    pub limit: u32,

    /// Hash of the raw key expression. Stored on the run identifier so that
    /// limit buckets can be re-targeted when a new function version changes
    /// the expression.
    #[serde(default)]
    pub hash: String,
}

impl ConcurrencyLimit {
    /// Whether this is a custom (keyed) limit requiring evaluation.
    pub fn is_custom_limit(&self) -> bool {
        self.key.is_some()
    }
}

/// Priority configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Priority {
    /// Optional expression producing a priority factor (seconds of virtual
    /// head start, positive or negative) from the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

// ============================================================================
// Pause state (schedule-time input)
// ============================================================================

/// Whether a function is administratively paused at a point in time.
///
/// Functions paused before "now" are skipped at schedule time.
pub fn is_paused(paused_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(paused_at, Some(at) if at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_function() -> Function {
        Function {
            id: Uuid::new_v4(),
            slug: "billing/charge".to_string(),
            version: 2,
            steps: vec![Step {
                id: "step".to_string(),
                name: "charge".to_string(),
                uri: "http://localhost:3000/api/fn".to_string(),
                retries: Some(1),
            }],
            triggers: vec![Trigger::Event(EventTrigger {
                event: "billing/invoice.created".to_string(),
                expression: None,
            })],
            cancel: vec![CancelDefinition {
                event: "billing/invoice.voided".to_string(),
                timeout: Some("24h".to_string()),
                expression: Some("event.data.invoice_id == async.data.invoice_id".to_string()),
            }],
            debounce: None,
            throttle: None,
            event_batch: None,
            concurrency: None,
            priority: None,
        }
    }

    #[test]
    fn step_runtime_type_is_uri_scheme() {
        let step = Step {
            id: "a".to_string(),
            name: "a".to_string(),
            uri: "http://example.com/fn".to_string(),
            retries: None,
        };
        assert_eq!(step.runtime_type(), "http");
        assert_eq!(step.retry_count(), DEFAULT_STEP_RETRIES);
    }

    #[test]
    fn function_round_trips_through_json() {
        let f = test_function();
        let json = serde_json::to_string(&f).unwrap();
        let back: Function = serde_json::from_str(&json).unwrap();
        assert_eq!(back.slug, f.slug);
        assert_eq!(back.steps[0].retries, Some(1));
        assert_eq!(back.cancel[0].event, "billing/invoice.voided");
    }

    #[test]
    fn cancel_expression_uses_if_key() {
        let f = test_function();
        let json = serde_json::to_value(&f).unwrap();
        assert!(json["cancel"][0].get("if").is_some());
        assert!(json["cancel"][0].get("expression").is_none());
    }

    #[test]
    fn custom_concurrency_limit_detection() {
        let keyed = ConcurrencyLimit {
            scope: ConcurrencyScope::Account,
            key: Some("event.data.customer_id".to_string()),
            limit: 5,
            hash: "abc".to_string(),
        };
        let plain = ConcurrencyLimit {
            scope: ConcurrencyScope::Function,
            key: None,
            limit: 10,
            hash: String::new(),
        };
        assert!(keyed.is_custom_limit());
        assert!(!plain.is_custom_limit());
    }

    #[test]
    fn paused_only_when_in_the_past() {
        let now = Utc::now();
        assert!(is_paused(Some(now - Duration::minutes(1)), now));
        assert!(!is_paused(Some(now + Duration::minutes(1)), now));
        assert!(!is_paused(None, now));
    }
}
