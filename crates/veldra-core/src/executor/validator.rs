// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-execution run validation.
//!
//! Validation stops a run without surfacing a retryable error: the queue
//! swallows the item and the run's recorded state is authoritative. Checks:
//! terminal status, the step cap, and an optional external cancellation
//! checker.

use async_trait::async_trait;

use veldra_dsl::Function;

use crate::error::{Error, Result};
use crate::queue::Item;
use crate::state::{Identifier, RunState, Status};

use super::{CancelRequest, Executor};

/// A matched cancellation from an external checker.
#[derive(Debug, Clone)]
pub struct Cancellation {
    /// Id of the matching cancellation record.
    pub id: String,
    /// Why the run is cancelled.
    pub reason: Option<String>,
}

/// Consulted before each step to enforce out-of-band cancellations
/// (account-, environment-, or function-scoped).
#[async_trait]
pub trait CancellationChecker: Send + Sync {
    /// Whether the run matches a standing cancellation.
    async fn check(
        &self,
        id: &Identifier,
        events: &[serde_json::Value],
    ) -> Result<Option<Cancellation>>;
}

impl Executor {
    /// Validate a run before executing a step. Returns `true` when the run
    /// must stop without retry.
    pub(crate) async fn validate_run(
        &self,
        item: &Item,
        state: &RunState,
        _function: &Function,
    ) -> Result<bool> {
        let md = state.metadata();

        if md.status.is_terminal() {
            return Ok(true);
        }

        // Runaway loops hit the step cap and overflow instead of spinning.
        if state.step_count() >= self.config.max_step_limit {
            self.state
                .set_status(state.identifier(), Status::Overflowed)
                .await?;
            return Ok(true);
        }

        if let Some(checker) = &self.cancellation_checker {
            if let Some(cancellation) = checker.check(state.identifier(), state.events()).await? {
                tracing::info!(
                    run_id = %item.identifier.run_id,
                    cancellation_id = %cancellation.id,
                    "run matched a standing cancellation"
                );
                match self
                    .cancel(item.identifier.run_id, CancelRequest::default())
                    .await
                {
                    Ok(()) | Err(Error::FunctionEnded) => {}
                    Err(err) => return Err(err),
                }
                return Ok(true);
            }
        }

        Ok(false)
    }
}
