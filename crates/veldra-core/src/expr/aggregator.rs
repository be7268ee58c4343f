// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Aggregate pause matching.
//!
//! With many pauses waiting on the same event name, evaluating every pause
//! expression per incoming event is O(pauses). The aggregator indexes pauses
//! by `(workspace, event name)` plus the constant equality subexpressions of
//! their match expression (`async.data.x == <literal>`), so a lookup touches
//! only pauses whose constants match the event: O(matches), not O(pauses).
//! Pauses whose expression has no indexable constant fall back to a scan
//! list within their bucket.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::event::TrackedEvent;
use crate::state::Pause;

use super::{BuiltinEvaluator, Evaluator, ExprError};

/// Index over pause expressions enabling sub-linear matching per event.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Add a pause to the index.
    async fn add_pause(&self, pause: &Pause) -> Result<(), ExprError>;

    /// Remove a pause from the index. Removing an unknown pause is not an
    /// error.
    async fn remove_pause(&self, pause: &Pause) -> Result<(), ExprError>;

    /// All pauses matching the event. Returns the matches and the number of
    /// candidate pauses evaluated.
    async fn evaluate_event(&self, evt: &TrackedEvent) -> Result<(Vec<Pause>, usize), ExprError>;
}

type BucketKey = (Uuid, String);
// Dotted path and canonical JSON rendering of the constant.
type ConstKey = (String, String);

#[derive(Default)]
struct Bucket {
    by_constant: HashMap<ConstKey, HashMap<Uuid, Pause>>,
    scan: HashMap<Uuid, Pause>,
}

impl Bucket {
    fn is_empty(&self) -> bool {
        self.by_constant.values().all(|m| m.is_empty()) && self.scan.is_empty()
    }
}

/// In-memory [`Aggregator`].
#[derive(Default)]
pub struct MemoryAggregator {
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl MemoryAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first equality constant over `async.*` in the pause expression,
    /// usable as an index key.
    fn index_key(pause: &Pause) -> Result<Option<ConstKey>, ExprError> {
        let Some(expression) = &pause.expression else {
            return Ok(None);
        };
        let eval = BuiltinEvaluator::compile(expression)?;
        for (path, lit) in eval.equality_constants() {
            if path.first().map(String::as_str) == Some("async") {
                let rendered = serde_json::to_string(&lit).unwrap_or_default();
                return Ok(Some((path.join("."), rendered)));
            }
        }
        Ok(None)
    }

    fn matches(pause: &Pause, evt: &TrackedEvent) -> bool {
        let Some(expression) = &pause.expression else {
            return true;
        };
        let Ok(eval) = BuiltinEvaluator::compile(expression) else {
            return false;
        };

        let mut data = serde_json::Map::new();
        data.insert("async".to_string(), evt.event.map());
        super::merge_missing(&mut data, &pause.expression_data);

        matches!(eval.evaluate(&Value::Object(data)), Ok(Value::Bool(true)))
    }
}

#[async_trait]
impl Aggregator for MemoryAggregator {
    async fn add_pause(&self, pause: &Pause) -> Result<(), ExprError> {
        let Some(event) = &pause.event else {
            // Pauses without an event filter are never event-matched.
            return Ok(());
        };
        let key = Self::index_key(pause)?;

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((pause.workspace_id, event.clone()))
            .or_default();
        match key {
            Some(k) => {
                bucket
                    .by_constant
                    .entry(k)
                    .or_default()
                    .insert(pause.id, pause.clone());
            }
            None => {
                bucket.scan.insert(pause.id, pause.clone());
            }
        }
        Ok(())
    }

    async fn remove_pause(&self, pause: &Pause) -> Result<(), ExprError> {
        let Some(event) = &pause.event else {
            return Ok(());
        };
        let mut buckets = self.buckets.lock().unwrap();
        let key = (pause.workspace_id, event.clone());
        if let Some(bucket) = buckets.get_mut(&key) {
            bucket.scan.remove(&pause.id);
            for m in bucket.by_constant.values_mut() {
                m.remove(&pause.id);
            }
            if bucket.is_empty() {
                buckets.remove(&key);
            }
        }
        Ok(())
    }

    async fn evaluate_event(&self, evt: &TrackedEvent) -> Result<(Vec<Pause>, usize), ExprError> {
        let candidates: Vec<Pause> = {
            let buckets = self.buckets.lock().unwrap();
            let Some(bucket) = buckets.get(&(evt.workspace_id, evt.event.name.clone())) else {
                return Ok((Vec::new(), 0));
            };

            let event_root = serde_json::json!({ "async": evt.event.map() });
            let mut out: Vec<Pause> = bucket.scan.values().cloned().collect();
            for ((path, rendered), pauses) in &bucket.by_constant {
                let segments: Vec<String> = path.split('.').map(String::from).collect();
                let mut cur = &event_root;
                let mut found = Some(());
                for seg in &segments {
                    match cur.get(seg) {
                        Some(v) => cur = v,
                        None => {
                            found = None;
                            break;
                        }
                    }
                }
                let value_matches = found.is_some()
                    && serde_json::to_string(cur).unwrap_or_default() == *rendered;
                if value_matches {
                    out.extend(pauses.values().cloned());
                }
            }
            out
        };

        let evaluated = candidates.len();
        let matches = candidates
            .into_iter()
            .filter(|p| Self::matches(p, evt))
            .collect();
        Ok((matches, evaluated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::state::Identifier;
    use chrono::Utc;
    use serde_json::json;
    use ulid::Ulid;

    fn identifier(workspace_id: Uuid) -> Identifier {
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
            workspace_id,
            app_id: Uuid::new_v4(),
            key: Ulid::new().to_string(),
            custom_concurrency_keys: vec![],
            priority_factor: None,
        }
    }

    fn pause(workspace_id: Uuid, event: &str, expression: Option<&str>) -> Pause {
        Pause {
            id: Uuid::new_v4(),
            workspace_id,
            identifier: identifier(workspace_id),
            group_id: String::new(),
            outgoing: "w".to_string(),
            incoming: "step".to_string(),
            step_name: "w".to_string(),
            opcode: Some("WaitForEvent".to_string()),
            expires: Utc::now() + chrono::Duration::minutes(10),
            event: Some(event.to_string()),
            expression: expression.map(String::from),
            expression_data: Default::default(),
            data_key: "w".to_string(),
            triggering_event_id: None,
            invoke_correlation_id: None,
            invoke_target_fn_id: None,
            step_span_id: None,
            trace_started_at: None,
            cancel: false,
            on_timeout: false,
        }
    }

    fn tracked(workspace_id: Uuid, name: &str, data: Value) -> TrackedEvent {
        TrackedEvent::new(
            workspace_id,
            Event {
                id: String::new(),
                name: name.to_string(),
                data,
                user: None,
                ts: Utc::now().timestamp_millis(),
            },
        )
    }

    #[tokio::test]
    async fn indexed_lookup_touches_only_matching_constants() {
        let agg = MemoryAggregator::new();
        let ws = Uuid::new_v4();

        for i in 0..20 {
            let p = pause(ws, "order/paid", Some(&format!("async.data.id == {i}")));
            agg.add_pause(&p).await.unwrap();
        }

        let (matches, evaluated) = agg
            .evaluate_event(&tracked(ws, "order/paid", json!({"id": 7})))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        // Only the bucket whose constant matched was evaluated.
        assert_eq!(evaluated, 1);
    }

    #[tokio::test]
    async fn unindexable_expressions_still_match_via_scan() {
        let agg = MemoryAggregator::new();
        let ws = Uuid::new_v4();

        let p = pause(ws, "order/paid", Some("async.data.total > 100"));
        agg.add_pause(&p).await.unwrap();

        let (matches, _) = agg
            .evaluate_event(&tracked(ws, "order/paid", json!({"total": 150})))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);

        let (matches, _) = agg
            .evaluate_event(&tracked(ws, "order/paid", json!({"total": 50})))
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn removed_pauses_stop_matching() {
        let agg = MemoryAggregator::new();
        let ws = Uuid::new_v4();
        let p = pause(ws, "x", Some("async.data.id == 1"));
        agg.add_pause(&p).await.unwrap();
        agg.remove_pause(&p).await.unwrap();

        let (matches, evaluated) = agg
            .evaluate_event(&tracked(ws, "x", json!({"id": 1})))
            .await
            .unwrap();
        assert!(matches.is_empty());
        assert_eq!(evaluated, 0);
    }

    #[tokio::test]
    async fn workspaces_are_isolated() {
        let agg = MemoryAggregator::new();
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();
        agg.add_pause(&pause(ws_a, "x", None)).await.unwrap();

        let (matches, _) = agg
            .evaluate_event(&tracked(ws_b, "x", json!({})))
            .await
            .unwrap();
        assert!(matches.is_empty());
    }
}
