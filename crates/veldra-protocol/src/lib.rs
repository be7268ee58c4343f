// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Veldra Protocol - the opcode protocol between executor and drivers.
//!
//! A runtime driver invokes a user SDK and returns a [`DriverResponse`]. The
//! response either carries the function's final output or a list of
//! [`OpcodeInstruction`]s - one instruction per step the SDK wants the engine
//! to perform next (run a step, sleep, wait for an event, invoke another
//! function, ...). The executor interprets those instructions; this crate
//! only defines their shape and the parsing of per-opcode options.
//!
//! Step results persisted by the engine are always wrapped in a single-key
//! object: `{"data": ...}` for success, `{"error": ...}` for a handled step
//! error. SDKs rely on the wrapper to distinguish memoized data from
//! memoized failures.

mod duration;
mod opcode;
mod response;

pub use duration::parse_duration;
pub use opcode::{
    InvokeFunctionOpts, OpcodeInstruction, OpcodeKind, SleepOpts, UserError, WaitForEventOpts,
};
pub use response::DriverResponse;

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A duration string could not be parsed.
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    /// An opcode was missing its options payload.
    #[error("opcode {0} requires options")]
    MissingOpts(&'static str),

    /// An opcode's options payload did not match the expected shape.
    #[error("invalid options for opcode {op}: {source}")]
    InvalidOpts {
        /// The opcode whose options failed to parse.
        op: &'static str,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type using [`ProtocolError`].
pub type Result<T> = std::result::Result<T, ProtocolError>;
