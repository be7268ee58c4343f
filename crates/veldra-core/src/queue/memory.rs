// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory queue backend.
//!
//! Items are held sorted by run-at time. Job-id idempotency is enforced for
//! the queue's lifetime, matching the at-most-once enqueue contract the
//! engine relies on. Tests drain the queue through [`MemoryQueue::pop_due`]
//! and re-deliver retried items with [`MemoryQueue::requeue`], which skips
//! the job-id check the way a substrate redelivery does.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Item, Queue, QueueError};

/// An item with its scheduled run time.
#[derive(Debug, Clone)]
pub struct ScheduledItem {
    /// When the item becomes due.
    pub at: DateTime<Utc>,
    /// The item.
    pub item: Item,
}

#[derive(Default)]
struct Inner {
    items: Vec<ScheduledItem>,
    job_ids: HashSet<String>,
}

/// In-memory [`Queue`].
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Whether the queue has no pending items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of pending items, soonest first.
    pub fn items(&self) -> Vec<ScheduledItem> {
        self.inner.lock().unwrap().items.clone()
    }

    /// Pop the next item due at or before `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<Item> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.items.iter().position(|s| s.at <= now)?;
        Some(inner.items.remove(idx).item)
    }

    /// Re-deliver an item (a retry); bypasses job-id idempotency.
    pub fn requeue(&self, item: Item, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .items
            .iter()
            .position(|s| s.at > at)
            .unwrap_or(inner.items.len());
        inner.items.insert(pos, ScheduledItem { at, item });
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, item: Item, at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(job_id) = &item.job_id {
            if inner.job_ids.contains(job_id) {
                return Err(QueueError::ItemExists);
            }
            inner.job_ids.insert(job_id.clone());
        }

        let pos = inner
            .items
            .iter()
            .position(|s| s.at > at)
            .unwrap_or(inner.items.len());
        inner.items.insert(pos, ScheduledItem { at, item });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Edge, Kind, Payload};
    use crate::state::Identifier;
    use ulid::Ulid;
    use uuid::Uuid;

    fn item(job_id: Option<&str>) -> Item {
        Item {
            job_id: job_id.map(String::from),
            group_id: "g".to_string(),
            workspace_id: Uuid::new_v4(),
            kind: Kind::Edge,
            identifier: Identifier {
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
                key: "k".to_string(),
                custom_concurrency_keys: vec![],
                priority_factor: None,
            },
            attempt: 0,
            max_attempts: None,
            payload: Payload::Edge {
                edge: Edge::source(),
            },
            throttle: None,
            run_info: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let q = MemoryQueue::new();
        q.enqueue(item(Some("a")), Utc::now()).await.unwrap();
        let err = q.enqueue(item(Some("a")), Utc::now()).await.unwrap_err();
        assert!(matches!(err, QueueError::ItemExists));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn items_pop_in_time_order() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        q.enqueue(item(Some("later")), now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        q.enqueue(item(Some("sooner")), now).await.unwrap();

        let first = q.pop_due(now).unwrap();
        assert_eq!(first.job_id.as_deref(), Some("sooner"));
        assert!(q.pop_due(now).is_none());

        let second = q.pop_due(now + chrono::Duration::seconds(11)).unwrap();
        assert_eq!(second.job_id.as_deref(), Some("later"));
    }
}
