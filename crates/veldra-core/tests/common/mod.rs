// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for veldra-core integration tests.
//!
//! Provides a `TestContext` wiring the executor to in-memory backends and a
//! scripted driver, plus a small drive loop standing in for the queue
//! runner: it pops due items, dispatches edges to the executor, fires pause
//! timeouts, and re-delivers retryable failures.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use ulid::Ulid;
use uuid::Uuid;

use veldra_core::batch::{BatchAppendResult, BatchAppendStatus, BatchItem, Batcher, ScheduleBatchOpts};
use veldra_core::debounce::{DebounceItem, Debouncer};
use veldra_core::driver::Driver;
use veldra_core::event::{Event, TrackedEvent};
use veldra_core::expr::MemoryAggregator;
use veldra_core::queue::{self, Edge, Item, MemoryQueue, Payload};
use veldra_core::state::{Identifier, MemoryStateStore, RunState};
use veldra_core::{
    CancelRequest, Config, Error, Executor, FinishHandler, FunctionLoader, HandlePauseResult,
    LifecycleListener, ResumeRequest, ScheduleRequest, SkipState,
};
use veldra_dsl::{Function, Step, Trigger};
use veldra_protocol::{DriverResponse, OpcodeInstruction, OpcodeKind, UserError};

// ============================================================================
// Test doubles
// ============================================================================

/// Function registry backing the executor's loader.
#[derive(Default)]
pub struct FunctionMap {
    functions: Mutex<HashMap<Uuid, Function>>,
}

impl FunctionMap {
    pub fn insert(&self, f: Function) {
        self.functions.lock().unwrap().insert(f.id, f);
    }
}

#[async_trait]
impl FunctionLoader for FunctionMap {
    async fn load_function(&self, id: &Identifier) -> Result<Function, Error> {
        self.functions
            .lock()
            .unwrap()
            .get(&id.workflow_id)
            .cloned()
            .ok_or_else(|| Error::Handler(format!("unknown function: {}", id.workflow_id)))
    }
}

/// One recorded driver invocation.
#[derive(Debug, Clone)]
pub struct DriverCall {
    /// The step key the driver was asked to run (planned step id when set).
    pub key: String,
    pub attempt: u32,
    /// Step ids memoized in the state passed to the driver.
    pub memoized: Vec<String>,
}

/// A driver returning scripted responses per step key.
#[derive(Default)]
pub struct ScriptedDriver {
    responses: Mutex<HashMap<String, VecDeque<DriverResponse>>>,
    pub calls: Mutex<Vec<DriverCall>>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for the given step key (FIFO per key).
    pub fn on(&self, key: &str, resp: DriverResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(resp);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn runtime_type(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        state: &RunState,
        _item: &Item,
        edge: &Edge,
        _step: &Step,
        _stack_index: usize,
        attempt: u32,
    ) -> Result<DriverResponse, Error> {
        let key = edge
            .incoming_generator_step
            .clone()
            .unwrap_or_else(|| edge.incoming.clone());

        let mut memoized: Vec<String> = state.stack().to_vec();
        memoized.sort();
        self.calls.lock().unwrap().push(DriverCall {
            key: key.clone(),
            attempt,
            memoized,
        });

        self.responses
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| Error::Handler(format!("no scripted response for step '{}'", key)))
    }
}

/// Records synthesized finish events.
#[derive(Default)]
pub struct FinishRecorder {
    pub events: Mutex<Vec<Event>>,
}

#[async_trait]
impl FinishHandler for FinishRecorder {
    async fn on_finish(&self, _state: &RunState, events: &[Event]) -> Result<(), Error> {
        self.events.lock().unwrap().extend(events.iter().cloned());
        Ok(())
    }
}

impl FinishRecorder {
    pub fn named(&self, name: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }
}

/// Records events published by the engine (invocation triggers).
#[derive(Default)]
pub struct SendRecorder {
    pub events: Mutex<Vec<Event>>,
}

#[async_trait]
impl veldra_core::SendEventHandler for SendRecorder {
    async fn send_event(&self, evt: Event, _item: &Item) -> Result<(), Error> {
        self.events.lock().unwrap().push(evt);
        Ok(())
    }
}

/// Records lifecycle notifications as `(hook, detail)` pairs.
#[derive(Default)]
pub struct RecordingLifecycle {
    pub entries: Mutex<Vec<(String, String)>>,
}

impl RecordingLifecycle {
    fn record(&self, hook: &str, detail: impl Into<String>) {
        self.entries
            .lock()
            .unwrap()
            .push((hook.to_string(), detail.into()));
    }

    pub fn count(&self, hook: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == hook)
            .count()
    }
}

#[async_trait]
impl LifecycleListener for RecordingLifecycle {
    async fn on_function_scheduled(&self, id: Identifier, _item: Item) {
        self.record("function_scheduled", id.run_id.to_string());
    }
    async fn on_function_started(&self, id: Identifier, _item: Item) {
        self.record("function_started", id.run_id.to_string());
    }
    async fn on_function_finished(&self, id: Identifier, _item: Item, resp: DriverResponse) {
        self.record(
            "function_finished",
            format!("{}:{}", id.run_id, resp.error()),
        );
    }
    async fn on_function_cancelled(&self, id: Identifier, _req: CancelRequest) {
        self.record("function_cancelled", id.run_id.to_string());
    }
    async fn on_function_skipped(&self, id: Identifier, _skip: SkipState) {
        self.record("function_skipped", id.run_id.to_string());
    }
    async fn on_step_started(&self, _id: Identifier, _item: Item, edge: Edge) {
        self.record("step_started", edge.incoming);
    }
    async fn on_step_scheduled(&self, _id: Identifier, item: Item, step_name: Option<String>) {
        self.record(
            "step_scheduled",
            format!("{}:{}", item.attempt, step_name.unwrap_or_default()),
        );
    }
    async fn on_step_finished(&self, _id: Identifier, _item: Item, edge: Edge, _resp: DriverResponse) {
        self.record("step_finished", edge.incoming);
    }
    async fn on_sleep(
        &self,
        _id: Identifier,
        _item: Item,
        op: OpcodeInstruction,
        _until: DateTime<Utc>,
    ) {
        self.record("sleep", op.id);
    }
    async fn on_wait_for_event(&self, _id: Identifier, _item: Item, op: OpcodeInstruction) {
        self.record("wait_for_event", op.id);
    }
    async fn on_wait_for_event_resumed(&self, id: Identifier, _req: ResumeRequest, _group: String) {
        self.record("wait_for_event_resumed", id.run_id.to_string());
    }
    async fn on_invoke_function(
        &self,
        _id: Identifier,
        _item: Item,
        op: OpcodeInstruction,
        _event_id: Ulid,
        correlation_id: String,
    ) {
        self.record("invoke_function", format!("{}:{}", op.id, correlation_id));
    }
    async fn on_invoke_function_resumed(&self, id: Identifier, _req: ResumeRequest, _group: String) {
        self.record("invoke_function_resumed", id.run_id.to_string());
    }
}

/// A batcher holding events in memory.
#[derive(Default)]
pub struct MemoryBatcher {
    pub max_size: usize,
    batches: Mutex<HashMap<Ulid, Vec<TrackedEvent>>>,
    open: Mutex<Option<Ulid>>,
    pub scheduled: Mutex<Vec<ScheduleBatchOpts>>,
}

impl MemoryBatcher {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Batcher for MemoryBatcher {
    async fn append(&self, item: BatchItem, _f: &Function) -> Result<BatchAppendResult, Error> {
        let mut open = self.open.lock().unwrap();
        let mut batches = self.batches.lock().unwrap();

        let (batch_id, status) = match *open {
            Some(batch_id) => (batch_id, BatchAppendStatus::Append),
            None => {
                let batch_id = Ulid::new();
                *open = Some(batch_id);
                (batch_id, BatchAppendStatus::New)
            }
        };

        let events = batches.entry(batch_id).or_default();
        events.push(TrackedEvent {
            internal_id: item.event_id,
            workspace_id: item.workspace_id,
            event: item.event,
        });

        let status = if events.len() >= self.max_size {
            *open = None;
            BatchAppendStatus::Full
        } else {
            status
        };
        Ok(BatchAppendResult { status, batch_id })
    }

    async fn schedule_execution(&self, opts: ScheduleBatchOpts) -> Result<(), Error> {
        self.scheduled.lock().unwrap().push(opts);
        Ok(())
    }

    async fn retrieve_items(&self, batch_id: Ulid) -> Result<Vec<TrackedEvent>, Error> {
        Ok(self
            .batches
            .lock()
            .unwrap()
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn expire_keys(&self, batch_id: Ulid) -> Result<(), Error> {
        self.batches.lock().unwrap().remove(&batch_id);
        Ok(())
    }
}

/// A debouncer recording forwarded items.
#[derive(Default)]
pub struct RecordingDebouncer {
    pub items: Mutex<Vec<DebounceItem>>,
}

#[async_trait]
impl Debouncer for RecordingDebouncer {
    async fn debounce(&self, item: DebounceItem, _f: &Function) -> Result<(), Error> {
        self.items.lock().unwrap().push(item);
        Ok(())
    }
}

// ============================================================================
// Test context
// ============================================================================

/// Wires the executor to in-memory backends for integration tests.
pub struct TestContext {
    pub workspace_id: Uuid,
    pub account_id: Uuid,
    pub app_id: Uuid,
    pub state: Arc<MemoryStateStore>,
    pub queue: Arc<MemoryQueue>,
    pub aggregator: Arc<MemoryAggregator>,
    pub functions: Arc<FunctionMap>,
    pub driver: Arc<ScriptedDriver>,
    pub finished: Arc<FinishRecorder>,
    pub sent: Arc<SendRecorder>,
    pub lifecycle: Arc<RecordingLifecycle>,
    pub debouncer: Arc<RecordingDebouncer>,
    pub batcher: Arc<MemoryBatcher>,
    pub executor: Arc<Executor>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let aggregator = Arc::new(MemoryAggregator::new());
        let functions = Arc::new(FunctionMap::default());
        let driver = ScriptedDriver::new();
        let finished = Arc::new(FinishRecorder::default());
        let sent = Arc::new(SendRecorder::default());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let debouncer = Arc::new(RecordingDebouncer::default());
        let batcher = Arc::new(MemoryBatcher::new(3));

        let executor = Arc::new(
            Executor::builder()
                .config(config)
                .state_store(state.clone())
                .queue(queue.clone())
                .function_loader(functions.clone())
                .driver(driver.clone())
                .aggregator(aggregator.clone())
                .finish_handler(finished.clone())
                .send_event_handler(sent.clone())
                .debouncer(debouncer.clone())
                .batcher(batcher.clone())
                .lifecycle_listener(lifecycle.clone())
                .build()
                .expect("failed to build executor"),
        );

        Self {
            workspace_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            state,
            queue,
            aggregator,
            functions,
            driver,
            finished,
            sent,
            lifecycle,
            debouncer,
            batcher,
            executor,
        }
    }

    /// Register a function with the loader.
    pub fn register(&self, f: &Function) {
        self.functions.insert(f.clone());
    }

    /// Build a schedule request for a single event.
    pub fn schedule_request(&self, f: &Function, evt: Event) -> ScheduleRequest {
        ScheduleRequest {
            function: f.clone(),
            account_id: self.account_id,
            workspace_id: self.workspace_id,
            app_id: self.app_id,
            events: vec![TrackedEvent::new(self.workspace_id, evt)],
            batch_id: None,
            idempotency_key: None,
            original_run_id: None,
            replay_id: None,
            at: None,
            context: None,
            prevent_debounce: false,
            function_paused_at: None,
        }
    }

    /// Schedule a run from a single event.
    pub async fn schedule(&self, f: &Function, evt: Event) -> Result<Identifier, Error> {
        self.register(f);
        self.executor.schedule(self.schedule_request(f, evt)).await
    }

    /// Drain all items due at `now`, emulating the queue runner: edges are
    /// executed, pause timeouts fire resumes, retryable failures re-deliver
    /// with an incremented attempt.
    pub async fn drive(&self, now: DateTime<Utc>) {
        for _ in 0..200 {
            let Some(item) = self.queue.pop_due(now) else {
                return;
            };
            self.dispatch(item, now).await;
        }
        panic!("drive loop did not converge");
    }

    async fn dispatch(&self, item: Item, now: DateTime<Utc>) {
        match &item.payload {
            Payload::PauseTimeout { pause_id, .. } => {
                let _ = self.executor.handle_pause_timeout(*pause_id).await;
            }
            Payload::Edge { edge } => {
                let edge = edge.clone();
                let result = self
                    .executor
                    .execute(&item.identifier, &item, &edge, 0)
                    .await;
                if let Err(err) = result {
                    if err.retryable() && queue::should_retry(item.attempt, item.max_attempts()) {
                        let mut retry = item.clone();
                        retry.attempt += 1;
                        self.queue.requeue(retry, now);
                    }
                }
            }
        }
    }

    /// Post an event: run pause matching, then invoke-finish handling for
    /// correlated finished events.
    pub async fn post_event(&self, evt: Event) -> (TrackedEvent, HandlePauseResult) {
        let tracked = TrackedEvent::new(self.workspace_id, evt);
        let res = self
            .executor
            .handle_pauses(&tracked)
            .await
            .expect("handle_pauses failed");
        if tracked.event.correlation_id().is_some() {
            let _ = self.executor.handle_invoke_finish(&tracked).await;
        }
        (tracked, res)
    }

    /// Re-run pause matching for an already tracked event (self-match tests).
    pub async fn post_tracked(&self, tracked: &TrackedEvent) -> HandlePauseResult {
        self.executor
            .handle_pauses(tracked)
            .await
            .expect("handle_pauses failed")
    }

    /// Wait for detached lifecycle tasks to settle.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Builders
// ============================================================================

/// A single-step function served by the scripted HTTP driver.
pub fn test_function(slug: &str, retries: u32) -> Function {
    Function {
        id: Uuid::new_v4(),
        slug: slug.to_string(),
        version: 1,
        steps: vec![Step {
            id: "step".to_string(),
            name: "step".to_string(),
            uri: "http://localhost:3000/api/fn".to_string(),
            retries: Some(retries),
        }],
        triggers: vec![Trigger::Event(veldra_dsl::EventTrigger {
            event: "test/run".to_string(),
            expression: None,
        })],
        cancel: vec![],
        debounce: None,
        throttle: None,
        event_batch: None,
        concurrency: None,
        priority: None,
    }
}

pub fn test_event(name: &str, data: Value) -> Event {
    Event {
        id: Ulid::new().to_string(),
        name: name.to_string(),
        data,
        user: None,
        ts: Utc::now().timestamp_millis(),
    }
}

fn blank_step() -> Step {
    Step {
        id: String::new(),
        name: String::new(),
        uri: String::new(),
        retries: None,
    }
}

/// A response carrying opcodes.
pub fn op_response(ops: Vec<OpcodeInstruction>) -> DriverResponse {
    let mut resp = DriverResponse::new(blank_step());
    resp.ops = ops;
    resp.status_code = 206;
    resp
}

/// A terminal response with the function's output.
pub fn final_response(output: Value) -> DriverResponse {
    let mut resp = DriverResponse::new(blank_step());
    resp.output = Some(output);
    resp.status_code = 200;
    resp
}

pub fn step_op(id: &str, data: Value) -> OpcodeInstruction {
    OpcodeInstruction {
        op: OpcodeKind::StepRun,
        id: id.to_string(),
        name: id.to_string(),
        data: Some(data),
        ..Default::default()
    }
}

pub fn step_error_op(id: &str, message: &str, no_retry: bool) -> OpcodeInstruction {
    OpcodeInstruction {
        op: OpcodeKind::StepError,
        id: id.to_string(),
        name: id.to_string(),
        error: Some(UserError {
            name: "Error".to_string(),
            message: message.to_string(),
            stack: None,
            data: None,
            no_retry,
        }),
        ..Default::default()
    }
}

pub fn planned_op(id: &str) -> OpcodeInstruction {
    OpcodeInstruction {
        op: OpcodeKind::StepPlanned,
        id: id.to_string(),
        name: id.to_string(),
        ..Default::default()
    }
}

pub fn sleep_op(id: &str, duration: &str) -> OpcodeInstruction {
    OpcodeInstruction {
        op: OpcodeKind::Sleep,
        id: id.to_string(),
        name: id.to_string(),
        opts: Some(json!({ "duration": duration })),
        ..Default::default()
    }
}

pub fn wait_op(id: &str, event: &str, timeout: &str, expression: Option<&str>) -> OpcodeInstruction {
    let mut opts = json!({ "event": event, "timeout": timeout });
    if let Some(expression) = expression {
        opts["if"] = json!(expression);
    }
    OpcodeInstruction {
        op: OpcodeKind::WaitForEvent,
        id: id.to_string(),
        name: id.to_string(),
        opts: Some(opts),
        ..Default::default()
    }
}

pub fn invoke_op(id: &str, function_id: &str, timeout: &str, payload: Value) -> OpcodeInstruction {
    OpcodeInstruction {
        op: OpcodeKind::InvokeFunction,
        id: id.to_string(),
        name: id.to_string(),
        opts: Some(json!({
            "function_id": function_id,
            "timeout": timeout,
            "payload": payload,
        })),
        ..Default::default()
    }
}

pub fn none_op() -> OpcodeInstruction {
    OpcodeInstruction {
        op: OpcodeKind::None,
        id: "none".to_string(),
        ..Default::default()
    }
}
