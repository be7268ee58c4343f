// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The pause engine: matching incoming events against saved pauses.
//!
//! Small candidate sets are scanned linearly with bounded concurrency; past
//! a threshold the aggregate matcher answers in O(matches). Both paths
//! process a matched pause identically: expired pauses are deleted, the
//! self-match guard skips a run's own trigger, cancellation pauses cancel
//! the run, everything else resumes it. Consumption is leased, so exactly
//! one concurrent matcher wins a pause.

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::TrackedEvent;
use crate::expr;
use crate::state::{Pause, StateError};

use super::{CancelRequest, Executor, ResumeRequest};

/// Counts of pause-matching work done for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlePauseResult {
    /// Pauses considered.
    pub attempted: u32,
    /// Pauses consumed (resumed, or cancelled-and-consumed).
    pub consumed: u32,
}

impl Executor {
    /// Match an incoming event against saved pauses.
    pub async fn handle_pauses(&self, evt: &TrackedEvent) -> Result<HandlePauseResult> {
        let candidates = self
            .state
            .pauses_by_event(evt.workspace_id, &evt.event.name)
            .await?;

        if candidates.len() > self.config.aggregate_pause_threshold && self.aggregator.is_some() {
            let res = self.handle_aggregate_pauses(evt).await;
            if let Err(err) = &res {
                error!(event = %evt.event.name, error = %err, "error handling aggregate pauses");
            }
            return res;
        }

        self.handle_pauses_naively(candidates, evt).await
    }

    /// Linear scan: fan candidate pauses out under a weighted cap.
    async fn handle_pauses_naively(
        &self,
        candidates: Vec<Pause>,
        evt: &TrackedEvent,
    ) -> Result<HandlePauseResult> {
        let semaphore = Semaphore::new(self.config.pause_handle_concurrency);

        let results = futures::future::join_all(candidates.iter().map(|pause| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|err| Error::Handler(format!("error acquiring semaphore: {}", err)))?;
                self.process_pause(pause, evt).await
            }
        }))
        .await;

        let mut res = HandlePauseResult::default();
        for result in results {
            res.attempted += 1;
            match result {
                Ok(true) => res.consumed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(event = %evt.event.name, error = %err, "error processing pause");
                }
            }
        }
        Ok(res)
    }

    /// Aggregate path: the expression index returns matches directly.
    async fn handle_aggregate_pauses(&self, evt: &TrackedEvent) -> Result<HandlePauseResult> {
        let aggregator = self
            .aggregator
            .as_ref()
            .ok_or_else(|| Error::Handler("no expression aggregator configured".to_string()))?;

        let (matches, evaluated) = aggregator
            .evaluate_event(evt)
            .await
            .map_err(Error::Expression)?;
        debug!(
            event = %evt.event.name,
            matches = matches.len(),
            evaluated,
            "aggregate pause evaluation"
        );

        let results = futures::future::join_all(
            matches.iter().map(|pause| self.process_pause(pause, evt)),
        )
        .await;

        let mut res = HandlePauseResult::default();
        for result in results {
            res.attempted += 1;
            match result {
                Ok(true) => res.consumed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(event = %evt.event.name, error = %err, "error processing pause");
                }
            }
        }
        Ok(res)
    }

    /// Process one candidate pause against an event. Returns whether the
    /// pause was consumed.
    pub(crate) async fn process_pause(&self, pause: &Pause, evt: &TrackedEvent) -> Result<bool> {
        let now = Utc::now();

        // The iterator may lag; a match after expiry deletes, never resumes.
        if pause.expired(now) {
            debug!(pause_id = %pause.id, "deleting expired pause");
            let _ = self.state.delete_pause(pause).await;
            self.unindex_pause(pause).await;
            return Ok(false);
        }

        // Self-match guard: the event that created a run can neither cancel
        // nor resume it.
        if let Some(triggering) = &pause.triggering_event_id {
            if *triggering == evt.internal_id.to_string() || *triggering == evt.event.id {
                return Ok(false);
            }
        }

        if pause.cancel {
            // The run may have finished since the pause was saved.
            if let Ok(false) = self.state.exists(pause.identifier.run_id).await {
                let _ = self.state.delete_pause(pause).await;
                self.unindex_pause(pause).await;
                return Ok(false);
            }
        }

        if let Some(expression) = &pause.expression {
            let evaluator = match self.evaluator(expression) {
                Ok(evaluator) => evaluator,
                Err(err) => {
                    error!(pause_id = %pause.id, error = %err, "error compiling pause expression");
                    return Ok(false);
                }
            };

            let mut data = serde_json::Map::new();
            data.insert("async".to_string(), evt.event.map());
            // Captured attributes stand in for state the matcher can't read.
            expr::merge_missing(&mut data, &pause.expression_data);

            let value = match evaluator.evaluate(&Value::Object(data)) {
                Ok(value) => value,
                Err(err) => {
                    warn!(pause_id = %pause.id, error = %err, "error evaluating pause expression");
                    return Ok(false);
                }
            };
            if value != Value::Bool(true) {
                return Ok(false);
            }
        }

        if pause.cancel {
            match self
                .cancel(
                    pause.identifier.run_id,
                    CancelRequest {
                        event_id: Some(evt.internal_id),
                        expression: pause.expression.clone(),
                    },
                )
                .await
            {
                Ok(()) => {}
                // The run already ended; nothing to cancel.
                Err(Error::FunctionEnded) => return Ok(false),
                Err(err) => {
                    return Err(Error::Handler(format!(
                        "error cancelling function: {}",
                        err
                    )))
                }
            }

            // The higher-level cancel doesn't consume; do it here.
            return match self.state.consume_pause(pause.id, None).await {
                Ok(())
                | Err(StateError::PauseLeased)
                | Err(StateError::PauseNotFound) => {
                    self.unindex_pause(pause).await;
                    Ok(true)
                }
                Err(err) => Err(Error::Handler(format!(
                    "error consuming pause after cancel: {}",
                    err
                ))),
            };
        }

        let resume_data = pause.resume_data(&evt.event.map());
        debug!(
            pause_id = %pause.id,
            data_key = %pause.data_key,
            "resuming pause"
        );
        self.resume(
            pause.clone(),
            ResumeRequest {
                with: resume_data.with,
                event_id: Some(evt.internal_id),
                run_id: resume_data.run_id,
                step_name: resume_data.step_name,
            },
        )
        .await?;
        Ok(true)
    }

    /// Resume the invoke pause correlated with a finished-function event.
    pub async fn handle_invoke_finish(&self, evt: &TrackedEvent) -> Result<()> {
        let correlation_id = evt.event.correlation_id().ok_or_else(|| {
            Error::Handler("no correlation ID found in event when trying to handle finish".to_string())
        })?;

        let pause = self
            .state
            .pause_by_invoke_correlation(evt.workspace_id, &correlation_id)
            .await?;

        if pause.expired(Utc::now()) {
            debug!(pause_id = %pause.id, "deleting expired pause");
            let _ = self.state.delete_pause(&pause).await;
            self.unindex_pause(&pause).await;
            return Ok(());
        }

        let resume_data = pause.resume_data(&evt.event.map());
        debug!(
            pause_id = %pause.id,
            correlation_id = %correlation_id,
            "resuming pause from invoke"
        );
        self.resume(
            pause,
            ResumeRequest {
                with: resume_data.with,
                event_id: Some(evt.internal_id),
                run_id: resume_data.run_id,
                step_name: resume_data.step_name,
            },
        )
        .await
    }
}
