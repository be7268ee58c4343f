// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for veldra-core.
//!
//! The queue consumes errors returned by the executor to decide whether and
//! when to retry an item. [`Error::never_retry`] and [`Error::retry_at`] wrap
//! an underlying error with an explicit retry directive;
//! [`Error::HandledStepError`] is a sentinel telling the queue to retry a
//! user step error that was already recorded. Conflict sentinels from the
//! state store and queue ([`StateError`], [`QueueError`]) are handled locally
//! and never surface from the engine's public operations.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::ConfigError;
use crate::expr::ExprError;
use crate::queue::QueueError;
use crate::state::StateError;

/// Result type using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A driver with the same runtime type was registered twice.
    #[error("runtime is already registered")]
    RuntimeRegistered,

    /// The executor was built without a state store.
    #[error("no state store provided")]
    NoStateStore,

    /// The executor was built without a queue.
    #[error("no queue provided")]
    NoQueue,

    /// The executor was built without a function loader.
    #[error("no function loader provided")]
    NoFunctionLoader,

    /// No driver is registered for a step's runtime type.
    #[error("runtime driver not found: '{0}'")]
    NoRuntimeDriver(String),

    /// The schedule request was forwarded to the debouncer.
    #[error("function debounced")]
    FunctionDebounced,

    /// The function is administratively paused; the run was skipped.
    #[error("function skipped")]
    FunctionSkipped,

    /// The run already reached a terminal state.
    #[error("function already ended")]
    FunctionEnded,

    /// The run was cancelled.
    #[error("function cancelled")]
    FunctionCancelled,

    /// Sentinel: a user step error was recorded and the queue should retry.
    #[error("handled step error")]
    HandledStepError,

    /// An edge referenced a step the function does not define.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Multi-step function definitions are not supported; fan-out happens
    /// through the opcode protocol.
    #[error("multi-step function definitions are not supported")]
    UnsupportedStepGraph,

    /// A step failed; the message carries the driver-reported error.
    #[error("step errored: {0}")]
    StepErrored(String),

    /// An expression failed to compile or evaluate.
    #[error(transparent)]
    Expression(#[from] ExprError),

    /// State store failure or conflict.
    #[error(transparent)]
    State(#[from] StateError),

    /// Queue failure or conflict.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Opcode protocol failure (bad options, bad durations).
    #[error(transparent)]
    Protocol(#[from] veldra_protocol::ProtocolError),

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A collaborator (handler, batcher, debouncer) failed.
    #[error("{0}")]
    Handler(String),

    /// Never retry the wrapped error.
    #[error("never retry: {0}")]
    NeverRetry(#[source] Box<Error>),

    /// Retry the wrapped error no earlier than the given time.
    #[error("retry at {0}: {1}")]
    RetryAt(DateTime<Utc>, #[source] Box<Error>),
}

impl Error {
    /// Wrap an error so the queue never retries it.
    pub fn never_retry(err: Error) -> Error {
        Error::NeverRetry(Box::new(err))
    }

    /// Wrap an error so the queue retries no earlier than `at`.
    pub fn retry_at(at: DateTime<Utc>, err: Error) -> Error {
        Error::RetryAt(at, Box::new(err))
    }

    /// Whether the queue may retry the item that produced this error.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            Error::NeverRetry(_)
                | Error::RuntimeRegistered
                | Error::NoStateStore
                | Error::NoQueue
                | Error::NoFunctionLoader
                | Error::FunctionDebounced
                | Error::FunctionSkipped
                | Error::FunctionEnded
                | Error::FunctionCancelled
                | Error::UnknownStep(_)
                | Error::UnsupportedStepGraph
                | Error::Expression(_)
                | Error::Protocol(_)
                | Error::Config(_)
        )
    }

    /// The earliest retry time, when one was attached.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::RetryAt(at, _) => Some(*at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_retry_is_not_retryable() {
        let err = Error::never_retry(Error::StepErrored("boom".to_string()));
        assert!(!err.retryable());
        assert!(Error::StepErrored("boom".to_string()).retryable());
    }

    #[test]
    fn retry_at_carries_the_timestamp() {
        let at = Utc::now();
        let err = Error::retry_at(at, Error::StepErrored("rate limited".to_string()));
        assert_eq!(err.retry_after(), Some(at));
        assert!(err.retryable());
    }

    #[test]
    fn handled_step_error_is_retryable() {
        assert!(Error::HandledStepError.retryable());
    }

    #[test]
    fn terminal_sentinels_are_not_retryable() {
        assert!(!Error::FunctionEnded.retryable());
        assert!(!Error::UnsupportedStepGraph.retryable());
    }
}
