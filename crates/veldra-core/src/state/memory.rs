// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state store backend.
//!
//! Reference implementation of [`StateStore`] used by tests and embedded
//! setups. All idempotency contracts are enforced the same way a durable
//! backend must enforce them: duplicate idempotency keys, duplicate step
//! output, duplicate pause ids, single-shot metadata fields, and pause
//! leasing.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use super::{
    Identifier, MetadataUpdate, NewRunInput, Pause, RunMetadata, RunState, StateError, StateStore,
    Status,
};

/// How long a pause lease blocks other consumers.
const PAUSE_LEASE_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct RunRecord {
    metadata: RunMetadata,
    events: Vec<Value>,
    actions: HashMap<String, Value>,
    stack: Vec<String>,
}

impl RunRecord {
    fn to_state(&self) -> RunState {
        RunState::new(
            self.metadata.clone(),
            self.events.clone(),
            self.actions.clone(),
            self.stack.clone(),
        )
    }
}

struct PauseRecord {
    pause: Pause,
    leased_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<Ulid, RunRecord>,
    // Deleted runs keep their metadata so terminal transitions stay
    // idempotent; `exists` consults `runs` only.
    deleted: HashMap<Ulid, RunRecord>,
    idempotency: HashSet<String>,
    pauses: HashMap<Uuid, PauseRecord>,
    pauses_by_event: HashMap<(Uuid, String), HashSet<Uuid>>,
    pauses_by_correlation: HashMap<(Uuid, String), Uuid>,
}

impl Inner {
    fn record(&self, run_id: Ulid) -> Result<&RunRecord, StateError> {
        self.runs
            .get(&run_id)
            .or_else(|| self.deleted.get(&run_id))
            .ok_or(StateError::RunNotFound(run_id))
    }

    fn record_mut(&mut self, run_id: Ulid) -> Result<&mut RunRecord, StateError> {
        if self.runs.contains_key(&run_id) {
            return Ok(self.runs.get_mut(&run_id).unwrap());
        }
        self.deleted
            .get_mut(&run_id)
            .ok_or(StateError::RunNotFound(run_id))
    }

    fn unindex_pause(&mut self, pause: &Pause) {
        if let Some(event) = &pause.event {
            if let Some(set) = self
                .pauses_by_event
                .get_mut(&(pause.workspace_id, event.clone()))
            {
                set.remove(&pause.id);
            }
        }
        if let Some(corr) = &pause.invoke_correlation_id {
            self.pauses_by_correlation
                .remove(&(pause.workspace_id, corr.clone()));
        }
    }
}

/// In-memory [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pauses. Test observability.
    pub fn pause_count(&self) -> usize {
        self.inner.lock().unwrap().pauses.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn new_run(&self, input: NewRunInput) -> Result<RunState, StateError> {
        let mut inner = self.inner.lock().unwrap();

        let key = input.identifier.idempotency_key();
        if inner.idempotency.contains(&key) {
            return Err(StateError::IdentifierExists);
        }
        inner.idempotency.insert(key);

        let record = RunRecord {
            metadata: RunMetadata {
                identifier: input.identifier.clone(),
                status: Status::Scheduled,
                started_at: None,
                span_id: Some(input.span_id),
                request_version: -1,
                disable_immediate_execution: false,
                debugger: false,
                context: input.context,
            },
            events: input.events,
            actions: HashMap::new(),
            stack: Vec::new(),
        };
        let state = record.to_state();
        inner.runs.insert(input.identifier.run_id, record);
        Ok(state)
    }

    async fn load(&self, run_id: Ulid) -> Result<RunState, StateError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.record(run_id)?.to_state())
    }

    async fn exists(&self, run_id: Ulid) -> Result<bool, StateError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.runs.contains_key(&run_id))
    }

    async fn metadata(&self, run_id: Ulid) -> Result<RunMetadata, StateError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.record(run_id)?.metadata.clone())
    }

    async fn update_metadata(
        &self,
        run_id: Ulid,
        update: MetadataUpdate,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.record_mut(run_id)?;
        let md = &mut record.metadata;

        md.context = update.context;
        md.disable_immediate_execution = update.disable_immediate_execution;
        md.debugger = update.debugger;
        md.request_version = update.request_version;
        // started_at and span_id are one-time writes.
        if md.started_at.is_none() {
            md.started_at = update.started_at;
        }
        if md.span_id.is_none() {
            md.span_id = update.span_id;
        }
        Ok(())
    }

    async fn save_response(
        &self,
        id: &Identifier,
        step_id: &str,
        output: String,
    ) -> Result<(), StateError> {
        let value: Value =
            serde_json::from_str(&output).map_err(|e| StateError::Internal {
                operation: "save_response",
                details: e.to_string(),
            })?;

        let mut inner = self.inner.lock().unwrap();
        let record = inner.record_mut(id.run_id)?;
        if record.actions.contains_key(step_id) {
            return Err(StateError::DuplicateResponse);
        }
        record.actions.insert(step_id.to_string(), value);
        record.stack.push(step_id.to_string());
        Ok(())
    }

    async fn set_status(&self, id: &Identifier, status: Status) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.record_mut(id.run_id)?;
        record.metadata.status = status;
        Ok(())
    }

    async fn cancel(&self, id: &Identifier) -> Result<(), StateError> {
        self.set_status(id, Status::Cancelled).await
    }

    async fn delete(&self, id: &Identifier) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.runs.remove(&id.run_id) {
            inner.deleted.insert(id.run_id, record);
        }
        Ok(())
    }

    async fn save_pause(&self, pause: Pause) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pauses.contains_key(&pause.id) {
            return Err(StateError::PauseAlreadyExists);
        }

        if let Some(event) = &pause.event {
            inner
                .pauses_by_event
                .entry((pause.workspace_id, event.clone()))
                .or_default()
                .insert(pause.id);
        }
        if let Some(corr) = &pause.invoke_correlation_id {
            inner
                .pauses_by_correlation
                .insert((pause.workspace_id, corr.clone()), pause.id);
        }
        inner.pauses.insert(
            pause.id,
            PauseRecord {
                pause,
                leased_at: None,
            },
        );
        Ok(())
    }

    async fn lease_pause(&self, id: Uuid) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.pauses.get_mut(&id).ok_or(StateError::PauseNotFound)?;
        if let Some(leased_at) = record.leased_at {
            if leased_at.elapsed() < PAUSE_LEASE_DURATION {
                return Err(StateError::PauseLeased);
            }
        }
        record.leased_at = Some(Instant::now());
        Ok(())
    }

    async fn consume_pause(&self, id: Uuid, with: Option<Value>) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.pauses.remove(&id).ok_or(StateError::PauseNotFound)?;
        let pause = record.pause;
        inner.unindex_pause(&pause);

        if !pause.data_key.is_empty() {
            let stored = with.unwrap_or_else(|| serde_json::json!({ "data": null }));
            if let Ok(run) = inner.record_mut(pause.identifier.run_id) {
                run.actions.insert(pause.data_key.clone(), stored);
                run.stack.push(pause.data_key.clone());
            }
        }
        Ok(())
    }

    async fn delete_pause(&self, pause: &Pause) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pauses.remove(&pause.id).is_some() {
            inner.unindex_pause(pause);
        }
        Ok(())
    }

    async fn pause_by_id(&self, id: Uuid) -> Result<Pause, StateError> {
        let inner = self.inner.lock().unwrap();
        inner
            .pauses
            .get(&id)
            .map(|r| r.pause.clone())
            .ok_or(StateError::PauseNotFound)
    }

    async fn pauses_by_event(
        &self,
        workspace_id: Uuid,
        event_name: &str,
    ) -> Result<Vec<Pause>, StateError> {
        let inner = self.inner.lock().unwrap();
        let Some(ids) = inner
            .pauses_by_event
            .get(&(workspace_id, event_name.to_string()))
        else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.pauses.get(id).map(|r| r.pause.clone()))
            .collect())
    }

    async fn pause_by_invoke_correlation(
        &self,
        workspace_id: Uuid,
        correlation_id: &str,
    ) -> Result<Pause, StateError> {
        let inner = self.inner.lock().unwrap();
        let id = inner
            .pauses_by_correlation
            .get(&(workspace_id, correlation_id.to_string()))
            .ok_or(StateError::PauseNotFound)?;
        inner
            .pauses
            .get(id)
            .map(|r| r.pause.clone())
            .ok_or(StateError::PauseNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identifier() -> Identifier {
        Identifier {
            workflow_id: Uuid::new_v4(),
            workflow_version: 1,
            run_id: Ulid::new(),
            event_id: Ulid::new(),
            event_ids: vec![],
            batch_id: None,
            original_run_id: None,
            replay_id: None,
            account_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            key: Ulid::new().to_string(),
            custom_concurrency_keys: vec![],
            priority_factor: None,
        }
    }

    fn new_input(id: &Identifier) -> NewRunInput {
        NewRunInput {
            identifier: id.clone(),
            events: vec![serde_json::json!({"name": "test", "data": {}})],
            context: Default::default(),
            span_id: "span".to_string(),
        }
    }

    fn pause_for(id: &Identifier, event: &str) -> Pause {
        Pause {
            id: Uuid::new_v4(),
            workspace_id: id.workspace_id,
            identifier: id.clone(),
            group_id: String::new(),
            outgoing: "a".to_string(),
            incoming: "step".to_string(),
            step_name: "a".to_string(),
            opcode: Some("WaitForEvent".to_string()),
            expires: Utc::now() + chrono::Duration::minutes(5),
            event: Some(event.to_string()),
            expression: None,
            expression_data: Default::default(),
            data_key: "a".to_string(),
            triggering_event_id: None,
            invoke_correlation_id: None,
            invoke_target_fn_id: None,
            step_span_id: None,
            trace_started_at: None,
            cancel: false,
            on_timeout: false,
        }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = MemoryStateStore::new();
        let id = identifier();
        store.new_run(new_input(&id)).await.unwrap();

        let mut second = identifier();
        second.workflow_id = id.workflow_id;
        second.key = id.key.clone();
        let err = store.new_run(new_input(&second)).await.unwrap_err();
        assert!(matches!(err, StateError::IdentifierExists));
    }

    #[tokio::test]
    async fn save_response_rejects_duplicates() {
        let store = MemoryStateStore::new();
        let id = identifier();
        store.new_run(new_input(&id)).await.unwrap();

        store
            .save_response(&id, "a", r#"{"data":1}"#.to_string())
            .await
            .unwrap();
        let err = store
            .save_response(&id, "a", r#"{"data":2}"#.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicateResponse));

        let state = store.load(id.run_id).await.unwrap();
        assert_eq!(state.action("a"), Some(&serde_json::json!({"data": 1})));
    }

    #[tokio::test]
    async fn metadata_start_fields_write_once() {
        let store = MemoryStateStore::new();
        let id = identifier();
        store.new_run(new_input(&id)).await.unwrap();

        let first = Utc::now();
        store
            .update_metadata(
                id.run_id,
                MetadataUpdate {
                    started_at: Some(first),
                    request_version: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_metadata(
                id.run_id,
                MetadataUpdate {
                    started_at: Some(first + chrono::Duration::hours(1)),
                    request_version: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let md = store.metadata(id.run_id).await.unwrap();
        assert_eq!(md.started_at, Some(first));
    }

    #[tokio::test]
    async fn lease_blocks_second_consumer() {
        let store = MemoryStateStore::new();
        let id = identifier();
        store.new_run(new_input(&id)).await.unwrap();
        let pause = pause_for(&id, "x");
        store.save_pause(pause.clone()).await.unwrap();

        store.lease_pause(pause.id).await.unwrap();
        let err = store.lease_pause(pause.id).await.unwrap_err();
        assert!(matches!(err, StateError::PauseLeased));

        store.consume_pause(pause.id, None).await.unwrap();
        let err = store.lease_pause(pause.id).await.unwrap_err();
        assert!(matches!(err, StateError::PauseNotFound));
    }

    #[tokio::test]
    async fn consume_stores_wrapped_null_without_data() {
        let store = MemoryStateStore::new();
        let id = identifier();
        store.new_run(new_input(&id)).await.unwrap();
        let pause = pause_for(&id, "x");
        store.save_pause(pause.clone()).await.unwrap();

        store.consume_pause(pause.id, None).await.unwrap();
        let state = store.load(id.run_id).await.unwrap();
        assert_eq!(state.action("a"), Some(&serde_json::json!({"data": null})));
    }

    #[tokio::test]
    async fn duplicate_pause_save_is_rejected() {
        let store = MemoryStateStore::new();
        let id = identifier();
        let pause = pause_for(&id, "x");
        store.save_pause(pause.clone()).await.unwrap();
        let err = store.save_pause(pause).await.unwrap_err();
        assert!(matches!(err, StateError::PauseAlreadyExists));
    }

    #[tokio::test]
    async fn deleted_runs_keep_metadata_but_not_existence() {
        let store = MemoryStateStore::new();
        let id = identifier();
        store.new_run(new_input(&id)).await.unwrap();
        store.cancel(&id).await.unwrap();
        store.delete(&id).await.unwrap();

        assert!(!store.exists(id.run_id).await.unwrap());
        let md = store.metadata(id.run_id).await.unwrap();
        assert_eq!(md.status, Status::Cancelled);
    }
}
