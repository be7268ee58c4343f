// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The executor: scheduling runs, executing steps, and finishing runs.
//!
//! [`Executor`] drives a single step of a function per queue pickup: it
//! loads run state, validates the run, invokes the step's runtime driver,
//! and interprets the response - either memoizing the function's final
//! output or dispatching the returned opcodes (follow-up steps, sleeps,
//! waits, invocations). Pauses created here are matched against incoming
//! events by the pause engine in [`pauses`].
//!
//! Correctness under retries and concurrent runners rests on idempotent
//! writes at every boundary: deterministic pause ids, queue job ids derived
//! from the run's idempotency key, and single-shot metadata fields.

mod opcodes;
mod pauses;
mod validator;

pub use pauses::HandlePauseResult;
pub use validator::{Cancellation, CancellationChecker};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use ulid::Ulid;
use uuid::Uuid;

use veldra_dsl::{ConcurrencyScope, Function, TRIGGER_STEP};
use veldra_protocol::DriverResponse;

use crate::batch::{BatchAppendStatus, BatchItem, Batcher, ScheduleBatchOpts, ScheduleBatchPayload};
use crate::config::{self, Config};
use crate::debounce::{DebounceItem, Debouncer};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::event::{self, Event, TrackedEvent};
use crate::expr::{self, Aggregator, EvaluatorFactory, ExprError};
use crate::lifecycle::LifecycleListener;
use crate::queue::{self, Edge, Item, Kind, Payload, Queue, QueueError, Throttle};
use crate::state::{
    CustomConcurrency, Identifier, MetadataUpdate, NewRunInput, Pause, RunState, StateError,
    StateStore, Status, TRACE_CARRIER_KEY,
};

// ============================================================================
// Collaborator traits
// ============================================================================

/// Loads function definitions for runs.
#[async_trait]
pub trait FunctionLoader: Send + Sync {
    /// Load the definition backing a run.
    async fn load_function(&self, id: &Identifier) -> Result<Function>;
}

/// Receives the finished/failed events synthesized when a run ends.
#[async_trait]
pub trait FinishHandler: Send + Sync {
    /// Publish finish events.
    async fn on_finish(&self, state: &RunState, events: &[Event]) -> Result<()>;
}

/// Publishes engine-emitted events (invocation triggers).
#[async_trait]
pub trait SendEventHandler: Send + Sync {
    /// Publish an event.
    async fn send_event(&self, evt: Event, item: &Item) -> Result<()>;
}

/// Notified when an invocation targets an unknown function.
#[async_trait]
pub trait InvokeNotFoundHandler: Send + Sync {
    /// Publish the synthesized finish events so the caller's pause resumes
    /// with an error.
    async fn on_invoke_not_found(&self, opts: InvokeNotFoundOpts, events: Vec<Event>)
        -> Result<()>;
}

/// Context for an invocation that found no target function.
#[derive(Debug, Clone)]
pub struct InvokeNotFoundOpts {
    /// The missing function.
    pub function_id: String,
    /// Correlation id of the caller's invoke pause.
    pub correlation_id: String,
    /// Run id of the caller, when known.
    pub run_id: Option<Ulid>,
    /// Workspace of the invocation.
    pub workspace_id: Uuid,
}

// ============================================================================
// Requests
// ============================================================================

/// A request to schedule a run.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// The function to run.
    pub function: Function,
    /// Owning account.
    pub account_id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Owning app.
    pub app_id: Uuid,
    /// Triggering events: one, or a batch.
    pub events: Vec<TrackedEvent>,
    /// Batch id when triggered by a batch.
    pub batch_id: Option<Ulid>,
    /// Explicit idempotency key.
    pub idempotency_key: Option<String>,
    /// The original run when this is a rerun.
    pub original_run_id: Option<Ulid>,
    /// The replay this run belongs to.
    pub replay_id: Option<Uuid>,
    /// Explicit schedule time.
    pub at: Option<DateTime<Utc>>,
    /// Caller context propagated into run metadata (trace carrier).
    pub context: Option<Map<String, Value>>,
    /// Bypass the debouncer (set by the debouncer itself).
    pub prevent_debounce: bool,
    /// When the function was administratively paused, if it was.
    pub function_paused_at: Option<DateTime<Utc>>,
}

/// A request to cancel a run.
#[derive(Debug, Clone, Default)]
pub struct CancelRequest {
    /// Internal id of the cancelling event, if any.
    pub event_id: Option<Ulid>,
    /// The expression that matched, if any.
    pub expression: Option<String>,
}

/// A request to resume a paused run.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// Wrapped payload stored under the pause's data key. `None` resumes
    /// with null data (timeouts).
    pub with: Option<Value>,
    /// Internal id of the resuming event; `None` for timeouts.
    pub event_id: Option<Ulid>,
    /// Run id of the finishing function, for invocation resumes.
    pub run_id: Option<Ulid>,
    /// Display name of the resumed step.
    pub step_name: Option<String>,
}

impl ResumeRequest {
    /// Whether the resume payload carries an error.
    pub fn has_error(&self) -> bool {
        self.with
            .as_ref()
            .and_then(|w| w.get("error"))
            .map(|e| !e.is_null())
            .unwrap_or(false)
    }
}

/// Why a schedule request was skipped.
#[derive(Debug, Clone, Default)]
pub struct SkipState {
    /// Cron schedule of the trigger, when the skipped run was cron-driven.
    pub cron_schedule: Option<String>,
}

#[derive(Serialize)]
struct FinishedEventData {
    function_id: String,
    run_id: Ulid,
    event: Value,
    events: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(rename = "correlation_id", skip_serializing_if = "Option::is_none")]
    invoke_correlation_id: Option<String>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Executor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    config: Option<Config>,
    state: Option<Arc<dyn StateStore>>,
    queue: Option<Arc<dyn Queue>>,
    function_loader: Option<Arc<dyn FunctionLoader>>,
    drivers: Vec<Arc<dyn Driver>>,
    eval_factory: Option<EvaluatorFactory>,
    aggregator: Option<Arc<dyn Aggregator>>,
    batcher: Option<Arc<dyn Batcher>>,
    debouncer: Option<Arc<dyn Debouncer>>,
    finish_handler: Option<Arc<dyn FinishHandler>>,
    send_event_handler: Option<Arc<dyn SendEventHandler>>,
    invoke_not_found_handler: Option<Arc<dyn InvokeNotFoundHandler>>,
    cancellation_checker: Option<Arc<dyn CancellationChecker>>,
    lifecycles: Vec<Arc<dyn LifecycleListener>>,
}

impl ExecutorBuilder {
    /// Override the engine config.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the state store. Required.
    pub fn state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the queue. Required.
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the function loader. Required.
    pub fn function_loader(mut self, loader: Arc<dyn FunctionLoader>) -> Self {
        self.function_loader = Some(loader);
        self
    }

    /// Register a runtime driver.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Override the expression evaluator factory.
    pub fn evaluator_factory(mut self, factory: EvaluatorFactory) -> Self {
        self.eval_factory = Some(factory);
        self
    }

    /// Set the aggregate pause matcher.
    pub fn aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Set the batch manager.
    pub fn batcher(mut self, batcher: Arc<dyn Batcher>) -> Self {
        self.batcher = Some(batcher);
        self
    }

    /// Set the debouncer.
    pub fn debouncer(mut self, debouncer: Arc<dyn Debouncer>) -> Self {
        self.debouncer = Some(debouncer);
        self
    }

    /// Set the finish handler.
    pub fn finish_handler(mut self, handler: Arc<dyn FinishHandler>) -> Self {
        self.finish_handler = Some(handler);
        self
    }

    /// Set the event publisher used for invocations.
    pub fn send_event_handler(mut self, handler: Arc<dyn SendEventHandler>) -> Self {
        self.send_event_handler = Some(handler);
        self
    }

    /// Set the invoke-not-found handler.
    pub fn invoke_not_found_handler(mut self, handler: Arc<dyn InvokeNotFoundHandler>) -> Self {
        self.invoke_not_found_handler = Some(handler);
        self
    }

    /// Set the cancellation checker consulted before each step.
    pub fn cancellation_checker(mut self, checker: Arc<dyn CancellationChecker>) -> Self {
        self.cancellation_checker = Some(checker);
        self
    }

    /// Register a lifecycle listener. Append-only; listeners cannot be
    /// removed after construction.
    pub fn lifecycle_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.lifecycles.push(listener);
        self
    }

    /// Build the executor, validating required collaborators and rejecting
    /// duplicate driver registrations.
    pub fn build(self) -> Result<Executor> {
        let state = self.state.ok_or(Error::NoStateStore)?;
        let queue = self.queue.ok_or(Error::NoQueue)?;
        let function_loader = self.function_loader.ok_or(Error::NoFunctionLoader)?;

        let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        for driver in self.drivers {
            let runtime = driver.runtime_type().to_string();
            if drivers.insert(runtime, driver).is_some() {
                return Err(Error::RuntimeRegistered);
            }
        }

        Ok(Executor {
            config: self.config.unwrap_or_default(),
            state,
            queue,
            function_loader,
            drivers,
            eval_factory: self
                .eval_factory
                .unwrap_or_else(expr::default_evaluator_factory),
            aggregator: self.aggregator,
            batcher: self.batcher,
            debouncer: self.debouncer,
            finish_handler: self.finish_handler,
            send_event_handler: self.send_event_handler,
            invoke_not_found_handler: self.invoke_not_found_handler,
            cancellation_checker: self.cancellation_checker,
            lifecycles: self.lifecycles,
        })
    }
}

// ============================================================================
// Executor
// ============================================================================

/// The step-function executor.
pub struct Executor {
    pub(crate) config: Config,
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) function_loader: Arc<dyn FunctionLoader>,
    pub(crate) drivers: HashMap<String, Arc<dyn Driver>>,
    pub(crate) eval_factory: EvaluatorFactory,
    pub(crate) aggregator: Option<Arc<dyn Aggregator>>,
    pub(crate) batcher: Option<Arc<dyn Batcher>>,
    pub(crate) debouncer: Option<Arc<dyn Debouncer>>,
    pub(crate) finish_handler: Option<Arc<dyn FinishHandler>>,
    pub(crate) send_event_handler: Option<Arc<dyn SendEventHandler>>,
    pub(crate) invoke_not_found_handler: Option<Arc<dyn InvokeNotFoundHandler>>,
    pub(crate) cancellation_checker: Option<Arc<dyn CancellationChecker>>,
    pub(crate) lifecycles: Vec<Arc<dyn LifecycleListener>>,
}

impl Executor {
    /// Start building an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Fan a notification out to every lifecycle listener on detached tasks.
    pub(crate) fn notify<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<dyn LifecycleListener>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        for listener in &self.lifecycles {
            tokio::spawn(f(Arc::clone(listener)));
        }
    }

    pub(crate) fn evaluator(
        &self,
        source: &str,
    ) -> std::result::Result<Arc<dyn expr::Evaluator>, ExprError> {
        (self.eval_factory)(source)
    }

    /// Add a pause to the aggregate matcher, when one is configured.
    pub(crate) async fn index_pause(&self, pause: &Pause) {
        if let Some(agg) = &self.aggregator {
            if let Err(err) = agg.add_pause(pause).await {
                warn!(pause_id = %pause.id, error = %err, "failed to index pause");
            }
        }
    }

    /// Remove a pause from the aggregate matcher, when one is configured.
    pub(crate) async fn unindex_pause(&self, pause: &Pause) {
        if let Some(agg) = &self.aggregator {
            if let Err(err) = agg.remove_pause(pause).await {
                warn!(pause_id = %pause.id, error = %err, "failed to unindex pause");
            }
        }
    }

    // ========================================================================
    // Schedule
    // ========================================================================

    /// Schedule a run from one event or a batch.
    ///
    /// Returns the new run's identifier, or a sentinel:
    /// [`Error::FunctionDebounced`] when forwarded to the debouncer,
    /// [`Error::FunctionSkipped`] when the function is paused, and
    /// [`Error::State`] with [`StateError::IdentifierExists`] for a
    /// duplicate schedule.
    pub async fn schedule(&self, req: ScheduleRequest) -> Result<Identifier> {
        let first = req
            .events
            .first()
            .ok_or_else(|| Error::Handler("schedule request carries no events".to_string()))?
            .clone();

        if req.function.debounce.is_some() && !req.prevent_debounce {
            let debouncer = self
                .debouncer
                .as_ref()
                .ok_or_else(|| Error::Handler("no debouncer configured".to_string()))?;
            debouncer
                .debounce(
                    DebounceItem {
                        account_id: req.account_id,
                        workspace_id: req.workspace_id,
                        app_id: req.app_id,
                        function_id: req.function.id,
                        function_version: req.function.version,
                        event_id: first.internal_id,
                        event: first.event.clone(),
                    },
                    &req.function,
                )
                .await?;
            return Err(Error::FunctionDebounced);
        }

        // Run ids embed the schedule timestamp; cancellation windows and
        // trace start times are derived from it.
        let run_id = Ulid::new();

        let key = if let Some(key) = &req.idempotency_key {
            key.clone()
        } else if req.original_run_id.is_some() {
            // Reruns must not dedupe against the original trigger.
            run_id.to_string()
        } else if req.events.len() == 1 {
            first.internal_id.to_string()
        } else if let Some(batch_id) = req.batch_id {
            batch_id.to_string()
        } else {
            String::new()
        };

        let event_ids: Vec<Ulid> = req.events.iter().map(|e| e.internal_id).collect();
        let mapped: Vec<Value> = req.events.iter().map(|e| e.event.map()).collect();

        let mut id = Identifier {
            workflow_id: req.function.id,
            workflow_version: req.function.version,
            run_id,
            event_id: first.internal_id,
            event_ids,
            batch_id: req.batch_id,
            original_run_id: req.original_run_id,
            replay_id: req.replay_id,
            account_id: req.account_id,
            workspace_id: req.workspace_id,
            app_id: req.app_id,
            key,
            custom_concurrency_keys: Vec::new(),
            priority_factor: None,
        };

        if veldra_dsl::is_paused(req.function_paused_at, Utc::now()) {
            let skip = SkipState {
                cron_schedule: first.event.cron_schedule(),
            };
            let skipped_id = id.clone();
            self.notify(move |l| {
                let id = skipped_id.clone();
                let skip = skip.clone();
                async move { l.on_function_skipped(id, skip).await }
            });
            return Err(Error::FunctionSkipped);
        }

        if let Some(concurrency) = &req.function.concurrency {
            for limit in &concurrency.limits {
                if !limit.is_custom_limit() {
                    continue;
                }
                let scope_id = match limit.scope {
                    ConcurrencyScope::Function => req.function.id,
                    ConcurrencyScope::Account => req.account_id,
                    ConcurrencyScope::Env => req.workspace_id,
                };
                let expr_src = limit.key.as_deref().unwrap_or_default();
                let evaluated = self
                    .evaluator(expr_src)?
                    .evaluate(&json!({ "event": mapped[0] }))
                    .map_err(Error::Expression)?;

                // The expression hash rides along so new function versions
                // can re-target limit buckets for in-progress runs.
                let hash = if limit.hash.is_empty() {
                    hash_id(expr_src)
                } else {
                    limit.hash.clone()
                };
                id.custom_concurrency_keys.push(CustomConcurrency {
                    key: format!("{}:{}", scope_id, hash_id(&evaluated.to_string())),
                    hash,
                    limit: limit.limit,
                });
            }
        }

        if let Some(priority) = &req.function.priority {
            if let Some(run_expr) = &priority.run {
                let factor = self
                    .evaluator(run_expr)?
                    .evaluate(&json!({ "event": mapped[0] }))
                    .ok()
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    .clamp(config::PRIORITY_FACTOR_MIN, config::PRIORITY_FACTOR_MAX);
                if factor != 0 {
                    id.priority_factor = Some(factor);
                }
            }
        }

        let span_id = new_span_id();
        let mut context = req.context.clone().unwrap_or_default();
        context.insert(
            TRACE_CARRIER_KEY.to_string(),
            json!({ "span_id": span_id, "run_id": run_id }),
        );

        self.state
            .new_run(NewRunInput {
                identifier: id.clone(),
                events: mapped.clone(),
                context,
                span_id,
            })
            .await?;

        // Cancellation triggers become pauses immediately, armed from the
        // run's creation time so historical events can never cancel it.
        if req.batch_id.is_none() {
            for cancel in &req.function.cancel {
                self.save_cancellation_pause(&id, cancel, &first, &mapped[0])
                    .await?;
            }
        }

        let mut at = Utc::now();
        if req.batch_id.is_none() {
            if let chrono::LocalResult::Single(evt_ts) =
                Utc.timestamp_millis_opt(first.event.ts)
            {
                if evt_ts > at {
                    // Future event timestamps schedule the run in the future.
                    at = evt_ts;
                }
            }
        }
        if let Some(explicit) = req.at {
            at = explicit;
        }

        let throttle = req.function.throttle.as_ref().map(|t| {
            let mut throttle_key = hash_id(&req.function.id.to_string());
            if let Some(key_expr) = &t.key {
                if let Ok(eval) = self.evaluator(key_expr) {
                    if let Ok(val) = eval.evaluate(&json!({ "event": mapped[0] })) {
                        throttle_key = format!("{}-{}", throttle_key, hash_id(&val.to_string()));
                    }
                }
            }
            Throttle {
                key: throttle_key,
                limit: t.limit,
                burst: t.burst,
                period_seconds: t.period_seconds,
            }
        });

        // Prefixing the job id with the function id means no invocation can
        // cause idempotency collisions across functions.
        let job_id = format!("{}:{}", req.function.id, id.key);
        let item = Item {
            job_id: Some(job_id.clone()),
            group_id: Uuid::new_v4().to_string(),
            workspace_id: req.workspace_id,
            kind: Kind::Start,
            identifier: id.clone(),
            attempt: 0,
            max_attempts: Some(config::SOURCE_EDGE_RETRIES),
            payload: Payload::Edge {
                edge: Edge::source(),
            },
            throttle,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(item.clone(), at).await {
            Ok(()) => {}
            Err(QueueError::ItemExists) => {
                return Err(Error::State(StateError::IdentifierExists));
            }
            Err(err) => {
                return Err(Error::Handler(format!(
                    "error enqueueing source edge '{}': {}",
                    job_id, err
                )));
            }
        }

        info!(
            run_id = %id.run_id,
            function = %req.function.slug,
            status = Status::Scheduled.as_str(),
            "scheduled function run"
        );

        let scheduled_id = id.clone();
        self.notify(move |l| {
            let id = scheduled_id.clone();
            let item = item.clone();
            async move { l.on_function_scheduled(id, item).await }
        });

        Ok(id)
    }

    async fn save_cancellation_pause(
        &self,
        id: &Identifier,
        cancel: &veldra_dsl::CancelDefinition,
        first: &TrackedEvent,
        first_map: &Value,
    ) -> Result<()> {
        let expires = match &cancel.timeout {
            Some(timeout) => {
                let dur = veldra_protocol::parse_duration(timeout)?;
                Utc::now() + chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::MAX)
            }
            None => {
                Utc::now()
                    + chrono::Duration::from_std(self.config.cancel_timeout)
                        .unwrap_or(chrono::Duration::MAX)
            }
        };

        let source = generate_cancel_expression(
            id.run_id.timestamp_ms() as i64,
            cancel.expression.as_deref(),
        );

        // Keep only the attributes the expression references; matching must
        // not need a state read.
        let evaluator = self.evaluator(&source)?;
        let expression_data = evaluator.filtered_attributes(&json!({ "event": first_map }));

        // Specialize `event.*` references into literals now that the event
        // is known; constants make the expression indexable.
        let interpolated = match expr::interpolate(&source, &json!({ "event": first_map })) {
            Ok(interpolated) => interpolated,
            Err(err) => {
                warn!(error = %err, expression = %source, "error interpolating cancellation expression");
                source.clone()
            }
        };

        let pause = Pause {
            id: Uuid::new_v4(),
            workspace_id: id.workspace_id,
            identifier: id.clone(),
            group_id: String::new(),
            outgoing: String::new(),
            incoming: String::new(),
            step_name: String::new(),
            opcode: None,
            expires,
            event: Some(cancel.event.clone()),
            expression: Some(interpolated),
            expression_data,
            data_key: String::new(),
            triggering_event_id: Some(first.internal_id.to_string()),
            invoke_correlation_id: None,
            invoke_target_fn_id: None,
            step_span_id: None,
            trace_started_at: None,
            cancel: true,
            on_timeout: false,
        };
        match self.state.save_pause(pause.clone()).await {
            Ok(()) | Err(StateError::PauseAlreadyExists) => {}
            Err(err) => {
                return Err(Error::Handler(format!("error saving pause: {}", err)));
            }
        }
        self.index_pause(&pause).await;
        Ok(())
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Execute a single step of a run, loaded from a queue item's edge.
    ///
    /// Returns `Ok(None)` when validation stopped the run without retry; the
    /// queue swallows the item. Otherwise returns the driver's normalized
    /// response after [`Executor::handle_response`] has processed it.
    pub async fn execute(
        &self,
        id: &Identifier,
        item: &Item,
        edge: &Edge,
        stack_index: usize,
    ) -> Result<Option<DriverResponse>> {
        let state = self.state.load(id.run_id).await?;
        let md = state.metadata().clone();
        let start = md.started_at.unwrap_or_else(Utc::now);

        // Trace continuation prefers the item's carrier, then run metadata;
        // absent both, the ambient context stands.
        if let Some(carrier) = trace_carrier(&md, Some(item)) {
            debug!(run_id = %id.run_id, trace = %carrier, "continuing trace context");
        }

        let function = self.function_loader.load_function(id).await?;

        if self.validate_run(item, &state, &function).await? {
            // Validation prevented execution and doesn't want a retry; no
            // error surfaces to the queue.
            return Ok(None);
        }

        let mut item = item.clone();
        let mut edge = edge.clone();

        // The trigger edge is synthetic: rewrite it to the sole user step.
        // Fan-out happens through opcodes, not through multi-step graphs.
        if edge.incoming == TRIGGER_STEP {
            if function.steps.len() > 1 {
                return Err(Error::UnsupportedStepGraph);
            }
            let step = function
                .steps
                .first()
                .ok_or_else(|| Error::UnknownStep(TRIGGER_STEP.to_string()))?;

            edge.outgoing = TRIGGER_STEP.to_string();
            edge.incoming = step.id.clone();
            item.payload = Payload::Edge { edge: edge.clone() };
            // Each edge carries its own retry budget; steps supply theirs.
            item.max_attempts = Some(step.retry_count() + 1);

            if item.attempt == 0 {
                let span_id = md
                    .span_id
                    .clone()
                    .unwrap_or_else(new_span_id);
                // One-time write; the state store ignores repeats.
                if let Err(err) = self
                    .state
                    .update_metadata(
                        id.run_id,
                        MetadataUpdate {
                            context: md.context.clone(),
                            disable_immediate_execution: md.disable_immediate_execution,
                            debugger: md.debugger,
                            span_id: Some(span_id),
                            started_at: Some(start),
                            request_version: md.request_version,
                        },
                    )
                    .await
                {
                    error!(run_id = %id.run_id, error = %err, "error updating metadata on function start");
                }
                self.state.set_status(id, Status::Running).await?;

                let started_id = id.clone();
                let started_item = item.clone();
                self.notify(move |l| {
                    let id = started_id.clone();
                    let item = started_item.clone();
                    async move { l.on_function_started(id, item).await }
                });
            }
        }

        // A sleep wake-up marks the sleep itself complete before re-entering
        // the function, so the SDK memoizes past it.
        if item.kind == Kind::Sleep && !edge.outgoing.is_empty() {
            let wrapped = serde_json::to_string(&json!({ "data": null }))?;
            match self.state.save_response(id, &edge.outgoing, wrapped).await {
                Ok(()) | Err(StateError::DuplicateResponse) => {}
                Err(err) => return Err(err.into()),
            }
        }

        // Requeued steps never re-execute: stored output short-circuits.
        let incoming = edge
            .incoming_generator_step
            .clone()
            .unwrap_or_else(|| edge.incoming.clone());
        if let Some(stored) = state.action(&incoming) {
            let step = function
                .steps
                .iter()
                .find(|s| s.id == edge.incoming)
                .cloned()
                .ok_or_else(|| Error::UnknownStep(edge.incoming.clone()))?;
            let mut resp = DriverResponse::new(step);
            resp.output = Some(stored.clone());
            return Ok(Some(resp));
        }

        let resp = self
            .run_step(id, &item, &edge, &state, stack_index, &function)
            .await?;

        debug!(
            run_id = %id.run_id,
            step = %resp.step.id,
            ops = resp.ops.len(),
            error = resp.err.as_deref().unwrap_or(""),
            "driver response received"
        );

        let out = resp.clone();
        self.handle_response(id, &item, &edge, resp).await?;
        Ok(Some(out))
    }

    async fn run_step(
        &self,
        id: &Identifier,
        item: &Item,
        edge: &Edge,
        state: &RunState,
        stack_index: usize,
        function: &Function,
    ) -> Result<DriverResponse> {
        let step = function
            .steps
            .iter()
            .find(|s| s.id == edge.incoming)
            .ok_or_else(|| Error::UnknownStep(edge.incoming.clone()))?;

        let started_id = id.clone();
        let started_item = item.clone();
        let started_edge = edge.clone();
        self.notify(move |l| {
            let id = started_id.clone();
            let item = started_item.clone();
            let edge = started_edge.clone();
            async move { l.on_step_started(id, item, edge).await }
        });

        let driver = self
            .drivers
            .get(step.runtime_type())
            .ok_or_else(|| Error::NoRuntimeDriver(step.runtime_type().to_string()))?;

        let mut resp = match driver
            .execute(state, item, edge, step, stack_index, item.attempt)
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                // Transport errors become response errors so downstream code
                // only ever inspects resp.err.
                let mut resp = DriverResponse::new(step.clone());
                resp.set_error(&err);
                resp
            }
        };

        if resp.step.id.is_empty() {
            resp.step = step.clone();
        }

        let attempts = step.retry_count() + 1;
        // A lone StepError at the final attempt is a permanent failure.
        if resp.ops.len() == 1
            && resp.ops[0].op == veldra_protocol::OpcodeKind::StepError
            && !queue::should_retry(item.attempt, attempts)
        {
            resp.no_retry = true;
        }
        if resp.err.is_some() && !queue::should_retry(item.attempt, attempts) {
            resp.no_retry = true;
        }

        Ok(resp)
    }

    // ========================================================================
    // Response handling
    // ========================================================================

    /// Interpret a normalized driver response: dispatch opcodes, or finalize
    /// the run with its output or error.
    pub async fn handle_response(
        &self,
        id: &Identifier,
        item: &Item,
        edge: &Edge,
        resp: DriverResponse,
    ) -> Result<()> {
        let finished_id = id.clone();
        let finished_item = item.clone();
        let finished_edge = edge.clone();
        let finished_resp = resp.clone();
        self.notify(move |l| {
            let id = finished_id.clone();
            let item = finished_item.clone();
            let edge = finished_edge.clone();
            let resp = finished_resp.clone();
            async move { l.on_step_finished(id, item, edge, resp).await }
        });

        if resp.err.is_some() {
            if resp.retryable() {
                // Retries are native to the queue; surfacing the error
                // schedules the next attempt.
                let mut retry_item = item.clone();
                retry_item.attempt += 1;
                let step_name = resp.step.name.clone();
                let retry_id = id.clone();
                self.notify(move |l| {
                    let id = retry_id.clone();
                    let item = retry_item.clone();
                    let name = step_name.clone();
                    async move { l.on_step_scheduled(id, item, Some(name)).await }
                });
                return Err(Error::StepErrored(resp.error()));
            }

            // Permanent failure: the run is done.
            self.state.set_status(id, Status::Failed).await?;
            let state = self.state.load(id.run_id).await?;
            if let Err(err) = self.run_finish_handler(&state, &resp).await {
                error!(run_id = %id.run_id, error = %err, "error running finish handler");
            }
            self.notify_function_finished(id, item, &resp);
            return Err(Error::never_retry(Error::StepErrored(resp.error())));
        }

        if !resp.ops.is_empty() {
            if let Err(err) = self.handle_opcode_response(&resp, item).await {
                if is_expression_compile_error(&err) {
                    // A bad expression can never succeed; fail the run.
                    let mut failed = resp.clone();
                    failed.set_error(&err);
                    failed.set_final();
                    let wrapped = serde_json::to_string(&json!({ "error": failed.error() }))?;
                    match self
                        .state
                        .save_response(id, &failed.step.id, wrapped)
                        .await
                    {
                        Ok(()) | Err(StateError::DuplicateResponse) => {}
                        Err(save_err) => return Err(save_err.into()),
                    }
                    self.state.set_status(id, Status::Failed).await?;
                    let state = self.state.load(id.run_id).await?;
                    if let Err(finish_err) = self.run_finish_handler(&state, &failed).await {
                        error!(run_id = %id.run_id, error = %finish_err, "error running finish handler");
                    }
                    self.notify_function_finished(id, item, &failed);
                    return Ok(());
                }
                return Err(err);
            }
            return Ok(());
        }

        // No opcodes: this is the function's terminal output.
        let output = serde_json::to_string(&resp.output.clone().unwrap_or(Value::Null))?;
        match self.state.save_response(id, &resp.step.id, output).await {
            Ok(()) => {}
            Err(StateError::DuplicateResponse) => {
                // Parallel executions may reach the end simultaneously; the
                // first writer finalizes the run.
                return Ok(());
            }
            Err(err) => {
                return Err(Error::Handler(format!(
                    "error saving function output: {}",
                    err
                )));
            }
        }

        let state = self.state.load(id.run_id).await?;
        if let Err(err) = self.run_finish_handler(&state, &resp).await {
            error!(run_id = %id.run_id, error = %err, "error running finish handler");
        }
        self.notify_function_finished(id, item, &resp);
        self.state.set_status(id, Status::Completed).await?;

        Ok(())
    }

    pub(crate) fn notify_function_finished(
        &self,
        id: &Identifier,
        item: &Item,
        resp: &DriverResponse,
    ) {
        let id = id.clone();
        let item = item.clone();
        let resp = resp.clone();
        self.notify(move |l| {
            let id = id.clone();
            let item = item.clone();
            let resp = resp.clone();
            async move { l.on_function_finished(id, item, resp).await }
        });
    }

    /// Synthesize and publish the run's finished (and failed) events.
    pub(crate) async fn run_finish_handler(
        &self,
        state: &RunState,
        resp: &DriverResponse,
    ) -> Result<()> {
        let Some(handler) = &self.finish_handler else {
            return Ok(());
        };

        let id = state.identifier();
        let function = self.function_loader.load_function(id).await?;
        let now = Utc::now();

        let error = if let Some(user_error) = &resp.user_error {
            Some(user_error.clone())
        } else if resp.err.is_some() {
            Some(resp.standard_error())
        } else {
            None
        };

        let mut events = Vec::new();
        for (n, run_event) in state.events().iter().enumerate() {
            if let Some(name) = run_event.get("name").and_then(|v| v.as_str()) {
                // Never recursively trigger internal finish handling.
                if name == event::FN_FINISHED_NAME || name == event::FN_FAILED_NAME {
                    continue;
                }
            }

            let invoke_id = event::correlation_id(run_event);
            if invoke_id.is_none() && n > 0 {
                // Only the first batch entry and correlated entries produce
                // finish events.
                continue;
            }

            let data = FinishedEventData {
                function_id: function.slug.clone(),
                run_id: id.run_id,
                event: run_event.clone(),
                events: state.events().to_vec(),
                error: error.clone(),
                result: resp.output.clone(),
                invoke_correlation_id: invoke_id,
            };
            let data = serde_json::to_value(&data)?;

            events.push(Event {
                id: Ulid::new().to_string(),
                name: event::FN_FINISHED_NAME.to_string(),
                data: data.clone(),
                user: None,
                ts: now.timestamp_millis(),
            });

            let cancelled = resp
                .err
                .as_deref()
                .map(|e| e.contains("function cancelled"))
                .unwrap_or(false);
            if resp.err.is_some() && !cancelled {
                events.push(Event {
                    id: Ulid::new().to_string(),
                    name: event::FN_FAILED_NAME.to_string(),
                    data,
                    user: None,
                    ts: now.timestamp_millis(),
                });
            }
        }

        handler.on_finish(state, &events).await
    }

    // ========================================================================
    // Cancel & resume
    // ========================================================================

    /// Cancel an in-progress run.
    ///
    /// Terminal runs return [`Error::FunctionEnded`], except already
    /// cancelled runs, which return `Ok` so cancellation is idempotent.
    pub async fn cancel(&self, run_id: Ulid, req: CancelRequest) -> Result<()> {
        let state = self.state.load(run_id).await?;
        let md = state.metadata().clone();

        match md.status {
            Status::Failed | Status::Completed | Status::Overflowed => {
                return Err(Error::FunctionEnded)
            }
            Status::Cancelled => return Ok(()),
            Status::Scheduled | Status::Running => {}
        }

        self.state
            .cancel(&md.identifier)
            .await
            .map_err(|err| Error::Handler(format!("error cancelling function: {}", err)))?;

        if let Err(err) = self.state.delete(&md.identifier).await {
            error!(run_id = %run_id, error = %err, "error deleting state after cancel");
        }

        let mut resp = DriverResponse::new(
            veldra_dsl::Step {
                id: String::new(),
                name: String::new(),
                uri: String::new(),
                retries: None,
            },
        );
        resp.set_error(Error::FunctionCancelled);
        if let Err(err) = self.run_finish_handler(&state, &resp).await {
            error!(run_id = %run_id, error = %err, "error running finish handler");
        }

        info!(run_id = %run_id, "cancelled function run");

        let cancelled_id = md.identifier.clone();
        self.notify(move |l| {
            let id = cancelled_id.clone();
            let req = req.clone();
            async move { l.on_function_cancelled(id, req).await }
        });

        Ok(())
    }

    /// Resume a paused run.
    ///
    /// Leasing guarantees at-most-once consumption: losing the lease (or
    /// finding the pause gone) is success, another runner won.
    pub async fn resume(&self, pause: Pause, req: ResumeRequest) -> Result<()> {
        match self.state.lease_pause(pause.id).await {
            Ok(()) => {}
            Err(StateError::PauseLeased) | Err(StateError::PauseNotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if pause.on_timeout && req.event_id.is_some() {
            // The event arrived before the timeout; this continuation must
            // not run. Consume the pause without data.
            return match self.state.consume_pause(pause.id, None).await {
                Ok(()) | Err(StateError::PauseNotFound) => {
                    self.unindex_pause(&pause).await;
                    Ok(())
                }
                Err(err) => Err(err.into()),
            };
        }

        self.state
            .consume_pause(pause.id, req.with.clone())
            .await
            .map_err(|err| Error::Handler(format!("error consuming pause via event: {}", err)))?;
        self.unindex_pause(&pause).await;

        debug!(
            pause_id = %pause.id,
            run_id = %pause.identifier.run_id,
            timeout = pause.on_timeout,
            cancel = pause.cancel,
            "resuming from pause"
        );

        // Enqueue after consuming: if the connection drops between the two,
        // the job must not run before the resume data is stored.
        let job_id = format!("{}-{}", pause.identifier.idempotency_key(), pause.data_key);
        let next_item = Item {
            job_id: Some(job_id),
            group_id: Uuid::new_v4().to_string(),
            workspace_id: pause.workspace_id,
            kind: Kind::Edge,
            identifier: pause.identifier.clone(),
            attempt: 0,
            max_attempts: None,
            payload: Payload::Edge { edge: pause.edge() },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        };
        match self.queue.enqueue(next_item, Utc::now()).await {
            Ok(()) | Err(QueueError::ItemExists) => {}
            Err(err) => {
                return Err(Error::Handler(format!(
                    "error enqueueing after pause: {}",
                    err
                )));
            }
        }

        let resumed_id = pause.identifier.clone();
        let group_id = pause.group_id.clone();
        let is_invoke = pause.opcode.as_deref() == Some("InvokeFunction");
        self.notify(move |l| {
            let id = resumed_id.clone();
            let req = req.clone();
            let group_id = group_id.clone();
            async move {
                if is_invoke {
                    l.on_invoke_function_resumed(id, req, group_id).await
                } else {
                    l.on_wait_for_event_resumed(id, req, group_id).await
                }
            }
        });

        Ok(())
    }

    /// Process a pause-timeout queue item.
    pub async fn handle_pause_timeout(&self, pause_id: Uuid) -> Result<()> {
        let pause = match self.state.pause_by_id(pause_id).await {
            Ok(pause) => pause,
            // Already consumed or deleted; the event won the race.
            Err(StateError::PauseNotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.resume(pause, ResumeRequest::default()).await
    }

    /// Handle an invocation targeting an unknown function: synthesize the
    /// finished event with an error so the caller's pause resumes.
    pub async fn invoke_not_found(&self, opts: InvokeNotFoundOpts) -> Result<()> {
        let Some(handler) = &self.invoke_not_found_handler else {
            return Ok(());
        };

        let now = Utc::now();
        let mut data = Map::new();
        data.insert("function_id".to_string(), json!(opts.function_id));
        data.insert("run_id".to_string(), json!(opts.run_id));
        data.insert(
            "error".to_string(),
            json!({ "name": "Error", "message": "function not found" }),
        );
        let mut engine_meta = Map::new();
        engine_meta.insert(
            event::CORRELATION_ID_KEY.to_string(),
            json!(opts.correlation_id),
        );
        data.insert(
            event::EVENT_DATA_PREFIX.to_string(),
            Value::Object(engine_meta),
        );
        let data = Value::Object(data);
        let evt = Event {
            id: Ulid::new().to_string(),
            name: event::FN_FINISHED_NAME.to_string(),
            data,
            user: None,
            ts: now.timestamp_millis(),
        };

        handler.on_invoke_not_found(opts, vec![evt]).await
    }

    // ========================================================================
    // Batch glue
    // ========================================================================

    /// Append an event to a function's batch, scheduling the batch timeout
    /// for new batches and running full batches immediately.
    pub async fn append_and_schedule_batch(
        &self,
        function: Function,
        item: BatchItem,
    ) -> Result<()> {
        let batcher = self
            .batcher
            .as_ref()
            .ok_or_else(|| Error::Handler("no batcher configured".to_string()))?;

        let result = batcher.append(item.clone(), &function).await?;
        match result.status {
            BatchAppendStatus::Append => Ok(()),
            BatchAppendStatus::New => {
                let config = function
                    .event_batch
                    .as_ref()
                    .ok_or_else(|| Error::Handler("function has no batch config".to_string()))?;
                let dur = veldra_protocol::parse_duration(&config.timeout)?;
                let at =
                    Utc::now() + chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::MAX);
                batcher
                    .schedule_execution(ScheduleBatchOpts {
                        payload: ScheduleBatchPayload {
                            batch_id: result.batch_id,
                            account_id: item.account_id,
                            workspace_id: item.workspace_id,
                            app_id: item.app_id,
                            function_id: item.function_id,
                            function_version: item.function_version,
                        },
                        at,
                    })
                    .await
            }
            BatchAppendStatus::Full => {
                self.retrieve_and_schedule_batch(
                    function,
                    ScheduleBatchPayload {
                        batch_id: result.batch_id,
                        account_id: item.account_id,
                        workspace_id: item.workspace_id,
                        app_id: item.app_id,
                        function_id: item.function_id,
                        function_version: item.function_version,
                    },
                )
                .await
            }
        }
    }

    /// Materialize a started batch into a run.
    pub async fn retrieve_and_schedule_batch(
        &self,
        function: Function,
        payload: ScheduleBatchPayload,
    ) -> Result<()> {
        let batcher = self
            .batcher
            .as_ref()
            .ok_or_else(|| Error::Handler("no batcher configured".to_string()))?;

        let events = batcher.retrieve_items(payload.batch_id).await?;
        if events.is_empty() {
            return Ok(());
        }

        let key = format!("{}-{}", function.id, payload.batch_id);
        match self
            .schedule(ScheduleRequest {
                function,
                account_id: payload.account_id,
                workspace_id: payload.workspace_id,
                app_id: payload.app_id,
                events,
                batch_id: Some(payload.batch_id),
                idempotency_key: Some(key),
                original_run_id: None,
                replay_id: None,
                at: None,
                context: None,
                prevent_debounce: false,
                function_paused_at: None,
            })
            .await
        {
            Ok(_) | Err(Error::FunctionSkipped) => {}
            Err(err) => return Err(err),
        }

        batcher.expire_keys(payload.batch_id).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Hash an id or evaluated key into a stable hex form.
pub(crate) fn hash_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)
}

/// The serialized trace carrier for a pickup: the queue item's carrier wins,
/// then the run metadata's; `None` leaves the ambient context in place.
pub(crate) fn trace_carrier(md: &crate::state::RunMetadata, item: Option<&Item>) -> Option<Value> {
    if let Some(item) = item {
        if let Some(carrier) = item.metadata.get(TRACE_CARRIER_KEY) {
            return Some(carrier.clone());
        }
    }
    md.context.get(TRACE_CARRIER_KEY).cloned()
}

/// Mint a span id for trace continuation.
pub(crate) fn new_span_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..16].to_string()
}

/// The canonical cancellation expression: only events after the run's
/// creation time may cancel it. `event.ts` is not used because callers may
/// schedule future runs with a future timestamp; events received in between
/// must still cancel.
pub(crate) fn generate_cancel_expression(run_time_ms: i64, expression: Option<&str>) -> String {
    let clause = format!("(async.ts == null || async.ts > {})", run_time_ms);
    match expression {
        Some(expression) => format!("{} && {}", expression, clause),
        None => clause,
    }
}

fn is_expression_compile_error(err: &Error) -> bool {
    match err {
        Error::Expression(ExprError::Parse(_)) => true,
        Error::NeverRetry(inner) => is_expression_compile_error(inner),
        Error::RetryAt(_, inner) => is_expression_compile_error(inner),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_expression_appends_ts_clause() {
        let expr = generate_cancel_expression(1700000000000, None);
        assert_eq!(expr, "(async.ts == null || async.ts > 1700000000000)");

        let expr = generate_cancel_expression(5, Some("event.data.id == async.data.id"));
        assert_eq!(
            expr,
            "event.data.id == async.data.id && (async.ts == null || async.ts > 5)"
        );
    }

    #[test]
    fn span_ids_are_sixteen_hex_chars() {
        let id = new_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hashed_ids_are_stable() {
        assert_eq!(hash_id("abc"), hash_id("abc"));
        assert_ne!(hash_id("abc"), hash_id("abd"));
    }
}
