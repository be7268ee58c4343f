// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opcode instructions returned by runtime drivers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::{parse_duration, ProtocolError};

/// The kind of instruction an SDK returned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
pub enum OpcodeKind {
    /// Terminate this execution thread. Used to coalesce parallel branches.
    #[default]
    None,
    /// A step ran inline and finished; `data` carries its output.
    Step,
    /// Same as [`OpcodeKind::Step`]; newer SDKs report the executed form.
    StepRun,
    /// A step ran and failed with a user-level error.
    StepError,
    /// A step was planned but not executed; the engine must schedule it.
    StepPlanned,
    /// Pause the run for a duration.
    Sleep,
    /// Pause the run until a matching event arrives or the wait expires.
    WaitForEvent,
    /// Invoke another function and pause until it finishes.
    InvokeFunction,
}

/// A user-level error raised inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserError {
    /// Error class name, e.g. `"Error"` or `"NonRetriableError"`.
    pub name: String,

    /// Human-readable message.
    pub message: String,

    /// Optional stack trace captured by the SDK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Optional structured payload attached to the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Set when the SDK marks the error non-retriable.
    #[serde(default)]
    pub no_retry: bool,
}

/// Options for [`OpcodeKind::Sleep`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepOpts {
    /// Sleep duration as a duration string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Absolute wake-up time. Takes precedence over `duration`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// Options for [`OpcodeKind::WaitForEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForEventOpts {
    /// Name of the awaited event.
    pub event: String,

    /// How long to wait, as a duration string.
    pub timeout: String,

    /// Optional match expression relating the awaited event (`async.*`) to
    /// the triggering event (`event.*`).
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl WaitForEventOpts {
    /// Absolute expiry computed from the timeout.
    pub fn expires(&self) -> Result<DateTime<Utc>, ProtocolError> {
        let dur = parse_duration(&self.timeout)?;
        Ok(Utc::now() + chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::MAX))
    }
}

/// Options for [`OpcodeKind::InvokeFunction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeFunctionOpts {
    /// Fully-qualified identifier of the function to invoke.
    pub function_id: String,

    /// Event payload delivered to the invoked function.
    pub payload: Value,

    /// How long to wait for the invoked function, as a duration string.
    pub timeout: String,
}

impl InvokeFunctionOpts {
    /// Absolute expiry computed from the timeout.
    pub fn expires(&self) -> Result<DateTime<Utc>, ProtocolError> {
        let dur = parse_duration(&self.timeout)?;
        Ok(Utc::now() + chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::MAX))
    }
}

/// A single instruction from a driver response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpcodeInstruction {
    /// Which instruction this is.
    pub op: OpcodeKind,

    /// Stable step identifier. Deterministic across retries; the engine keys
    /// memoized output, queue jobs, and pause ids off it.
    pub id: String,

    /// User-defined display name.
    #[serde(default)]
    pub name: String,

    /// Per-opcode options (sleep duration, wait options, invoke options).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,

    /// Step output for [`OpcodeKind::Step`] / [`OpcodeKind::StepRun`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// User error for [`OpcodeKind::StepError`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
}

impl OpcodeInstruction {
    /// The name shown to users: the display name when set, else the step id.
    pub fn user_defined_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// The step output as it is persisted: wrapped in `{"data": ...}` for
    /// success or `{"error": ...}` for a handled step error.
    pub fn output(&self) -> Result<String, ProtocolError> {
        let wrapped = match self.op {
            OpcodeKind::StepError => {
                serde_json::json!({ "error": self.error })
            }
            _ => serde_json::json!({ "data": self.data }),
        };
        Ok(serde_json::to_string(&wrapped)?)
    }

    /// Parse sleep options and resolve them into a duration from now.
    pub fn sleep_duration(&self) -> Result<Duration, ProtocolError> {
        let opts: SleepOpts = self.parse_opts("Sleep")?;
        if let Some(until) = opts.until {
            let now = Utc::now();
            let dur = (until - now).to_std().unwrap_or(Duration::ZERO);
            return Ok(dur);
        }
        match opts.duration {
            Some(d) => parse_duration(&d),
            None => Err(ProtocolError::MissingOpts("Sleep")),
        }
    }

    /// Parse wait-for-event options.
    pub fn wait_for_event_opts(&self) -> Result<WaitForEventOpts, ProtocolError> {
        self.parse_opts("WaitForEvent")
    }

    /// Parse invoke-function options.
    pub fn invoke_function_opts(&self) -> Result<InvokeFunctionOpts, ProtocolError> {
        self.parse_opts("InvokeFunction")
    }

    fn parse_opts<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
    ) -> Result<T, ProtocolError> {
        let opts = self.opts.clone().ok_or(ProtocolError::MissingOpts(op))?;
        serde_json::from_value(opts).map_err(|source| ProtocolError::InvalidOpts { op, source })
    }
}
