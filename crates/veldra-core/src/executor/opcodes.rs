// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The opcode interpreter.
//!
//! A driver response with opcodes means the SDK wants more work scheduled.
//! Opcodes are split into groups; opcodes within a group dispatch
//! concurrently, and when a group fans out (more than one opcode) every
//! opcode starts its own history group. Ordering across concurrent opcodes
//! is not guaranteed; duplicates collapse through deterministic pause ids
//! and idempotent output writes and job ids.

use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use veldra_protocol::{DriverResponse, OpcodeInstruction, OpcodeKind};

use crate::error::Error;
use crate::event::{self, NewInvocationEventOpts};
use crate::expr;
use crate::queue::{self, Edge, Item, Kind, Payload, QueueError};
use crate::state::{MetadataUpdate, Pause, StateError};

use super::Executor;

/// A group of opcodes dispatched together.
#[derive(Debug, Clone)]
pub(crate) struct OpcodeGroup {
    pub ops: Vec<OpcodeInstruction>,
    /// When set, every opcode in the group starts a fresh history group;
    /// parallel steps are tracked individually.
    pub should_start_history_group: bool,
}

/// Split a response's opcodes into dispatch groups. A single linear opcode
/// continues the incoming item's group; fan-out starts new ones.
pub(crate) fn op_groups(ops: &[OpcodeInstruction]) -> Vec<OpcodeGroup> {
    vec![OpcodeGroup {
        ops: ops.to_vec(),
        should_start_history_group: ops.len() > 1,
    }]
}

impl Executor {
    /// Interpret a driver response's opcode list.
    pub(crate) async fn handle_opcode_response(
        &self,
        resp: &DriverResponse,
        item: &Item,
    ) -> Result<(), Error> {
        let run_id = item.identifier.run_id;
        let md = self.state.metadata(run_id).await?;

        let mut update: Option<MetadataUpdate> = None;
        if md.request_version == -1 {
            // First response from the SDK: record its protocol version.
            update = Some(MetadataUpdate {
                context: md.context.clone(),
                debugger: md.debugger,
                disable_immediate_execution: md.disable_immediate_execution,
                request_version: resp.request_version,
                span_id: None,
                started_at: None,
            });
        }
        if resp.ops.len() > 1 && !md.disable_immediate_execution {
            // Parallel fan-out requires the SDK to pre-plan steps instead of
            // executing them inline.
            let update = update.get_or_insert(MetadataUpdate {
                context: md.context.clone(),
                debugger: md.debugger,
                disable_immediate_execution: true,
                request_version: resp.request_version,
                span_id: None,
                started_at: None,
            });
            update.disable_immediate_execution = true;
        }
        if let Some(update) = update {
            self.state.update_metadata(run_id, update).await?;
        }

        for group in op_groups(&resp.ops) {
            self.handle_group(group, resp, item).await?;
        }
        Ok(())
    }

    /// Dispatch one group's opcodes concurrently. The group fails as a unit;
    /// failures inherit the response's retry directives.
    async fn handle_group(
        &self,
        group: OpcodeGroup,
        resp: &DriverResponse,
        item: &Item,
    ) -> Result<(), Error> {
        let OpcodeGroup {
            ops,
            should_start_history_group,
        } = group;

        let work: Vec<(OpcodeInstruction, Item)> = ops
            .into_iter()
            .map(|op| {
                let mut group_item = item.clone();
                if should_start_history_group {
                    group_item.group_id = Uuid::new_v4().to_string();
                }
                (op, group_item)
            })
            .collect();

        let results = futures::future::join_all(
            work.iter().map(|(op, group_item)| self.handle_op(op, group_item)),
        )
        .await;

        let mut first_err: Option<Error> = None;
        for result in results {
            if let Err(err) = result {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!(error = %err, "additional opcode handler error");
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) if resp.no_retry => Err(Error::never_retry(err)),
            Some(err) => match resp.retry_at {
                Some(at) => Err(Error::retry_at(at, err)),
                None => Err(err),
            },
        }
    }

    /// Dispatch a single opcode.
    pub(crate) async fn handle_op(&self, op: &OpcodeInstruction, item: &Item) -> Result<(), Error> {
        let Payload::Edge { edge } = &item.payload else {
            return Err(Error::Handler(
                "unexpected queue payload handling opcode".to_string(),
            ));
        };

        match op.op {
            // None terminates this execution thread: parallel branches
            // coalesce back to a single continuation.
            OpcodeKind::None => Ok(()),
            OpcodeKind::Step | OpcodeKind::StepRun => self.handle_step(op, item, edge).await,
            OpcodeKind::StepError => self.handle_step_error(op, item, edge).await,
            OpcodeKind::StepPlanned => self.handle_step_planned(op, item, edge).await,
            OpcodeKind::Sleep => self.handle_sleep(op, item, edge).await,
            OpcodeKind::WaitForEvent => self.handle_wait_for_event(op, item, edge).await,
            OpcodeKind::InvokeFunction => self.handle_invoke_function(op, item, edge).await,
        }
    }

    /// A step finished inline: memoize its output and re-enter the function.
    async fn handle_step(&self, op: &OpcodeInstruction, item: &Item, edge: &Edge) -> Result<(), Error> {
        let output = op.output()?;
        match self
            .state
            .save_response(&item.identifier, &op.id, output)
            .await
        {
            // Duplicate writes collapse; the follow-up job id dedupes too.
            Ok(()) | Err(StateError::DuplicateResponse) => {}
            Err(err) => return Err(err.into()),
        }

        let group_id = Uuid::new_v4().to_string();
        let job_id = format!("{}-{}", item.identifier.idempotency_key(), op.id);
        let next_item = Item {
            job_id: Some(job_id),
            group_id,
            workspace_id: item.workspace_id,
            kind: Kind::Edge,
            identifier: item.identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: op.id.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(next_item.clone(), Utc::now()).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let id = item.identifier.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = next_item.clone();
            // The follow-up is a discovery step; naming it after its
            // predecessor would mislabel history.
            async move { l.on_step_scheduled(id, item, None).await }
        });

        Ok(())
    }

    /// A step failed with a user-level error. Retryable failures go back to
    /// the queue; permanent ones memoize the error and take the error edge
    /// so the user's catch path runs.
    async fn handle_step_error(
        &self,
        op: &OpcodeInstruction,
        item: &Item,
        edge: &Edge,
    ) -> Result<(), Error> {
        let user_error = op.error.as_ref().ok_or_else(|| {
            Error::Handler("no user error defined in StepError opcode".to_string())
        })?;

        let mut retryable = true;
        if user_error.no_retry {
            retryable = false;
        }
        if !queue::should_retry(item.attempt, item.max_attempts()) {
            retryable = false;
        }

        if retryable {
            let mut retry_item = item.clone();
            retry_item.attempt += 1;
            let id = item.identifier.clone();
            let name = op.name.clone();
            self.notify(move |l| {
                let id = id.clone();
                let item = retry_item.clone();
                let name = name.clone();
                async move { l.on_step_scheduled(id, item, Some(name)).await }
            });
            return Err(Error::HandledStepError);
        }

        // Final attempt: memoize the error (wrapped in `error` so SDKs can
        // distinguish it from data) and enqueue the error edge.
        let output = op.output()?;
        match self
            .state
            .save_response(&item.identifier, &op.id, output)
            .await
        {
            Ok(()) | Err(StateError::DuplicateResponse) => {}
            Err(err) => return Err(err.into()),
        }

        let group_id = Uuid::new_v4().to_string();
        let job_id = format!("{}-{}-failure", item.identifier.idempotency_key(), op.id);
        let next_item = Item {
            job_id: Some(job_id),
            group_id,
            workspace_id: item.workspace_id,
            kind: Kind::EdgeError,
            identifier: item.identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: op.id.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(next_item.clone(), Utc::now()).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let id = item.identifier.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = next_item.clone();
            async move { l.on_step_scheduled(id, item, None).await }
        });

        Ok(())
    }

    /// A step was planned: enqueue its execution, keyed by the planned step
    /// id so memoization doesn't collide with the discovery step.
    async fn handle_step_planned(
        &self,
        op: &OpcodeInstruction,
        item: &Item,
        edge: &Edge,
    ) -> Result<(), Error> {
        let group_id = Uuid::new_v4().to_string();
        let job_id = format!("{}-{}-plan", item.identifier.idempotency_key(), op.id);
        let next_item = Item {
            job_id: Some(job_id),
            group_id,
            workspace_id: item.workspace_id,
            kind: Kind::Edge,
            identifier: item.identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    // The planned step hasn't run yet; outgoing/incoming stay
                    // on the discovery edge.
                    outgoing: edge.outgoing.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: Some(op.id.clone()),
                },
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(next_item.clone(), Utc::now()).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let id = item.identifier.clone();
        let name = op.name.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = next_item.clone();
            let name = name.clone();
            async move { l.on_step_scheduled(id, item, Some(name)).await }
        });

        Ok(())
    }

    /// Re-enqueue the run after the sleep so the step can be marked complete.
    async fn handle_sleep(&self, op: &OpcodeInstruction, item: &Item, edge: &Edge) -> Result<(), Error> {
        let dur = op.sleep_duration()?;
        let until = Utc::now() + chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::MAX);

        let group_id = Uuid::new_v4().to_string();
        let job_id = format!("{}-{}", item.identifier.idempotency_key(), op.id);
        let next_item = Item {
            job_id: Some(job_id),
            // The wake-up re-calls the step; same group for correlation.
            group_id,
            workspace_id: item.workspace_id,
            kind: Kind::Sleep,
            identifier: item.identifier.clone(),
            attempt: 0,
            max_attempts: item.max_attempts,
            payload: Payload::Edge {
                edge: Edge {
                    outgoing: op.id.clone(),
                    incoming: edge.incoming.clone(),
                    incoming_generator_step: None,
                },
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(next_item.clone(), until).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let id = item.identifier.clone();
        let lifecycle_item = item.clone();
        let lifecycle_op = op.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = lifecycle_item.clone();
            let op = lifecycle_op.clone();
            async move { l.on_sleep(id, item, op, until).await }
        });

        Ok(())
    }

    /// Persist a wait-for-event pause and its timeout job.
    async fn handle_wait_for_event(
        &self,
        op: &OpcodeInstruction,
        item: &Item,
        edge: &Edge,
    ) -> Result<(), Error> {
        let mut opts = op.wait_for_event_opts()?;
        let expires = opts.expires()?;

        // Capture only the attributes the expression references; matching
        // must not read run state.
        let mut expression_data = serde_json::Map::new();
        if let Some(expression) = &opts.expression {
            expr::validate(expression).map_err(Error::Expression)?;
            let evaluator = self.evaluator(expression).map_err(Error::Expression)?;
            let run = self.state.load(item.identifier.run_id).await?;
            expression_data = evaluator.filtered_attributes(&run.expression_data());
        }

        // Specialize `event.*` references into literals; constants are what
        // the aggregate matcher indexes.
        if let Some(expression) = opts.expression.clone() {
            if expression.contains("event.") {
                match self.state.load(item.identifier.run_id).await {
                    Ok(run) => {
                        match expr::interpolate(&expression, &json!({ "event": run.event() })) {
                            Ok(interpolated) => opts.expression = Some(interpolated),
                            Err(err) => {
                                warn!(
                                    error = %err,
                                    expression = %expression,
                                    "error interpolating wait-for-event expression"
                                );
                            }
                        }
                    }
                    Err(err) => {
                        error!(
                            run_id = %item.identifier.run_id,
                            error = %err,
                            "error loading state to interpolate wait-for-event"
                        );
                    }
                }
            }
        }

        let pause = Pause {
            id: Pause::deterministic_id(item.identifier.run_id, &op.id),
            workspace_id: item.workspace_id,
            identifier: item.identifier.clone(),
            group_id: item.group_id.clone(),
            outgoing: op.id.clone(),
            incoming: edge.incoming.clone(),
            step_name: op.user_defined_name().to_string(),
            opcode: Some(op.op.to_string()),
            expires,
            event: Some(opts.event.clone()),
            expression: opts.expression.clone(),
            expression_data,
            data_key: op.id.clone(),
            triggering_event_id: None,
            invoke_correlation_id: None,
            invoke_target_fn_id: None,
            step_span_id: None,
            trace_started_at: None,
            cancel: false,
            on_timeout: false,
        };
        match self.state.save_pause(pause.clone()).await {
            Ok(()) => {}
            // Deterministic ids make re-issuance a no-op.
            Err(StateError::PauseAlreadyExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.index_pause(&pause).await;

        // Event arrival and timeout race for the pause; leasing ensures the
        // function is called exactly once whichever route wins.
        let job_id = format!("{}-{}-wait", item.identifier.idempotency_key(), op.id);
        let timeout_item = Item {
            job_id: Some(job_id),
            group_id: item.group_id.clone(),
            workspace_id: item.workspace_id,
            kind: Kind::Pause,
            identifier: item.identifier.clone(),
            attempt: 0,
            max_attempts: None,
            payload: Payload::PauseTimeout {
                pause_id: pause.id,
                on_timeout: true,
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(timeout_item, expires).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let id = item.identifier.clone();
        let lifecycle_item = item.clone();
        let lifecycle_op = op.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = lifecycle_item.clone();
            let op = lifecycle_op.clone();
            async move { l.on_wait_for_event(id, item, op).await }
        });

        Ok(())
    }

    /// Publish an invocation event and pause until the target finishes.
    async fn handle_invoke_function(
        &self,
        op: &OpcodeInstruction,
        item: &Item,
        edge: &Edge,
    ) -> Result<(), Error> {
        let send_event = self.send_event_handler.as_ref().ok_or_else(|| {
            Error::Handler("no event publisher configured for invocations".to_string())
        })?;

        let opts = op.invoke_function_opts()?;
        let expires = opts.expires()?;

        let correlation_id = format!("{}.{}", item.identifier.run_id, op.id);
        let expression = format!(
            "async.data.{}.{} == \"{}\"",
            event::EVENT_DATA_PREFIX,
            event::CORRELATION_ID_KEY,
            correlation_id
        );
        expr::validate(&expression).map_err(Error::Expression)?;

        let evt = event::new_invocation_event(NewInvocationEventOpts {
            payload: opts.payload.clone(),
            function_id: opts.function_id.clone(),
            correlation_id: Some(correlation_id.clone()),
        });

        let now = Utc::now();
        let pause = Pause {
            id: Pause::deterministic_id(item.identifier.run_id, &op.id),
            workspace_id: item.workspace_id,
            identifier: item.identifier.clone(),
            group_id: item.group_id.clone(),
            outgoing: op.id.clone(),
            incoming: edge.incoming.clone(),
            step_name: op.user_defined_name().to_string(),
            opcode: Some(op.op.to_string()),
            expires,
            event: Some(event::FN_FINISHED_NAME.to_string()),
            expression: Some(expression),
            expression_data: Default::default(),
            data_key: op.id.clone(),
            // The invocation event must not resolve its own pause.
            triggering_event_id: Some(evt.id.clone()),
            invoke_correlation_id: Some(correlation_id.clone()),
            invoke_target_fn_id: Some(opts.function_id.clone()),
            step_span_id: Some(super::new_span_id()),
            trace_started_at: Some(now),
            cancel: false,
            on_timeout: false,
        };
        match self.state.save_pause(pause.clone()).await {
            Ok(()) => {}
            Err(StateError::PauseAlreadyExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.index_pause(&pause).await;

        let job_id = format!("{}-{}-invoke", item.identifier.idempotency_key(), op.id);
        let timeout_item = Item {
            job_id: Some(job_id),
            group_id: item.group_id.clone(),
            workspace_id: item.workspace_id,
            kind: Kind::Pause,
            identifier: item.identifier.clone(),
            attempt: 0,
            max_attempts: None,
            payload: Payload::PauseTimeout {
                pause_id: pause.id,
                on_timeout: true,
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(timeout_item, expires).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let event_id = ulid::Ulid::from_string(&evt.id).unwrap_or_default();
        send_event
            .send_event(evt, item)
            .await
            .map_err(|err| {
                Error::Handler(format!("error publishing invocation event: {}", err))
            })?;

        let id = item.identifier.clone();
        let lifecycle_item = item.clone();
        let lifecycle_op = op.clone();
        let lifecycle_corr = correlation_id.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = lifecycle_item.clone();
            let op = lifecycle_op.clone();
            let corr = lifecycle_corr.clone();
            async move { l.on_invoke_function(id, item, op, event_id, corr).await }
        });

        Ok(())
    }
}
