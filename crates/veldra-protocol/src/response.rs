// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Normalized driver responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use veldra_dsl::Step;

use crate::{OpcodeInstruction, OpcodeKind};

fn default_request_version() -> i32 {
    -1
}

/// The outcome of invoking a user SDK for one step.
///
/// Either `ops` is non-empty (the SDK wants more work scheduled) or the
/// response is terminal: `output` carries the function's return value, or
/// `err` carries a failure. The executor normalizes responses so that
/// downstream code only ever inspects `err` for failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverResponse {
    /// The step this response belongs to.
    pub step: Step,

    /// Instructions returned by the SDK, empty for terminal responses.
    #[serde(default)]
    pub ops: Vec<OpcodeInstruction>,

    /// Final function output for terminal responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// User-visible error payload, set when the SDK surfaced a structured
    /// function-level failure. Authoritative for what the user sees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_error: Option<Value>,

    /// Transport- or function-level error. Authoritative for retry
    /// classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    /// When set, the queue must not retry this item.
    #[serde(default)]
    pub no_retry: bool,

    /// Optional earliest time for the next retry, from SDK headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,

    /// Protocol version the SDK declared. `-1` means not yet negotiated.
    #[serde(default = "default_request_version")]
    pub request_version: i32,

    /// HTTP-ish status code reported by the driver.
    #[serde(default)]
    pub status_code: i32,

    /// Size of the raw response body in bytes.
    #[serde(default)]
    pub output_size: usize,

    #[serde(skip)]
    is_final: bool,
}

impl DriverResponse {
    /// A blank response for the given step.
    pub fn new(step: Step) -> Self {
        Self {
            step,
            ops: Vec::new(),
            output: None,
            user_error: None,
            err: None,
            no_retry: false,
            retry_at: None,
            request_version: -1,
            status_code: 0,
            output_size: 0,
            is_final: false,
        }
    }

    /// Whether the queue may retry after this response.
    pub fn retryable(&self) -> bool {
        !self.no_retry && !self.is_final
    }

    /// Record an error on the response.
    pub fn set_error(&mut self, err: impl std::fmt::Display) {
        self.err = Some(err.to_string());
    }

    /// Mark the response final: no retries regardless of attempt count.
    pub fn set_final(&mut self) {
        self.is_final = true;
        self.no_retry = true;
    }

    /// The error message, or an empty string.
    pub fn error(&self) -> String {
        self.err.clone().unwrap_or_default()
    }

    /// The error as a structured payload for user-visible finished events.
    pub fn standard_error(&self) -> Value {
        serde_json::json!({
            "name": "Error",
            "message": self.error(),
        })
    }

    /// The single step-like instruction of this response, when the response
    /// represents one executed (or failed) step. Used for span naming.
    pub fn trace_visible_step_execution(&self) -> Option<&OpcodeInstruction> {
        if self.ops.len() != 1 {
            return None;
        }
        let op = &self.ops[0];
        match op.op {
            OpcodeKind::Step | OpcodeKind::StepRun | OpcodeKind::StepError => Some(op),
            _ => None,
        }
    }

    /// Whether this response is the function's terminal result.
    pub fn is_trace_visible_function_execution(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step() -> Step {
        Step {
            id: "step".to_string(),
            name: "step".to_string(),
            uri: "http://localhost/fn".to_string(),
            retries: None,
        }
    }

    #[test]
    fn final_responses_are_not_retryable() {
        let mut resp = DriverResponse::new(step());
        assert!(resp.retryable());
        resp.set_final();
        assert!(!resp.retryable());
    }

    #[test]
    fn single_step_op_is_trace_visible() {
        let mut resp = DriverResponse::new(step());
        resp.ops.push(OpcodeInstruction {
            op: OpcodeKind::StepRun,
            id: "a".to_string(),
            data: Some(json!(1)),
            ..Default::default()
        });
        assert!(resp.trace_visible_step_execution().is_some());
        assert!(!resp.is_trace_visible_function_execution());

        resp.ops.push(OpcodeInstruction {
            op: OpcodeKind::StepPlanned,
            id: "b".to_string(),
            ..Default::default()
        });
        assert!(resp.trace_visible_step_execution().is_none());
    }

    #[test]
    fn request_version_defaults_to_unnegotiated() {
        let resp: DriverResponse =
            serde_json::from_value(json!({ "step": step(), "ops": [] })).unwrap();
        assert_eq!(resp.request_version, -1);
    }
}
