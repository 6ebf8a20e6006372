//! Persistent FIFO queue of sync operations.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use serde_json::Value;
use tracing::{debug, info, warn};

use limeaura_common::{Error, OperationId, Result};
use limeaura_storage::{Collection, Document, LocalStore, Query, Record, RecordStore};

use crate::operation::{Change, OperationState, SyncOperation};

/// Optional fields written together with a state change.
#[derive(Debug, Clone, Default)]
pub struct MarkExtra {
    pub retries: Option<u32>,
    /// `Some(None)` clears the last error.
    pub last_error: Option<Option<String>>,
    pub change: Option<Change>,
}

impl MarkExtra {
    pub fn retries(retries: u32) -> Self {
        Self {
            retries: Some(retries),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.change = Some(change);
        self
    }
}

/// Queue counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
    pub conflict: usize,
}

impl QueueStatus {
    /// Operations still waiting to reach the remote, conflicts excluded.
    pub fn outstanding(&self) -> usize {
        self.pending + self.syncing + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0 && self.conflict == 0
    }
}

/// Queue of mutations awaiting confirmation, stored in the
/// `syncOperations` collection.
pub struct SyncQueue<S: LocalStore + ?Sized> {
    store: Arc<S>,
    /// Serializes read-modify-write updates of queue records.
    write_lock: tokio::sync::Mutex<()>,
    /// Last `created_at` handed out, in microseconds.
    last_created: Mutex<i64>,
}

impl<S: LocalStore + ?Sized> SyncQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            write_lock: tokio::sync::Mutex::new(()),
            last_created: Mutex::new(0),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist a new pending operation.
    ///
    /// # Errors
    /// - Store unavailable (quota exceeded, database error)
    /// - Empty entity id
    pub async fn enqueue(&self, entity_id: impl Into<String>, change: Change) -> Result<SyncOperation> {
        let entity_id = entity_id.into();
        if entity_id.is_empty() {
            return Err(Error::InvalidInput("entity_id cannot be empty".to_string()));
        }

        let op = SyncOperation {
            id: OperationId::generate(),
            entity_id,
            change,
            state: OperationState::Pending,
            retries: 0,
            created_at: self.next_created_at(),
            last_error: None,
        };

        self.store.put_record(&op).await?;
        debug!("Enqueued {}", op);
        Ok(op)
    }

    /// Pending and failed operations, oldest first.
    ///
    /// Records that no longer decode are left out; see
    /// [`query_operations`](Self::query_operations).
    pub async fn pending_and_failed(&self) -> Result<Vec<SyncOperation>> {
        let query = Query::any_of(
            "state",
            [OperationState::Pending.as_str(), OperationState::Failed.as_str()],
        )
        .sort_by("created_at");
        self.query_operations(&query).await
    }

    /// Operations awaiting conflict resolution, oldest first.
    pub async fn conflicts(&self) -> Result<Vec<SyncOperation>> {
        let query = Query::equals("state", OperationState::Conflict.as_str()).sort_by("created_at");
        self.query_operations(&query).await
    }

    pub async fn get(&self, id: &OperationId) -> Result<Option<SyncOperation>> {
        self.store.get_record(id.as_str()).await
    }

    /// Move an operation to `state`, writing `extra` in the same update.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `InvalidInput` for `Synced` (use [`remove`](Self::remove)) or a
    ///   transition the state machine does not allow
    pub async fn mark(
        &self,
        id: &OperationId,
        state: OperationState,
        extra: MarkExtra,
    ) -> Result<SyncOperation> {
        if state == OperationState::Synced {
            return Err(Error::InvalidInput(format!(
                "operation {} cannot be marked synced; remove it instead",
                id
            )));
        }

        let _guard = self.write_lock.lock().await;
        self.apply(id, state, extra).await
    }

    /// Mark an operation failed, incrementing its retry count.
    pub async fn mark_failed(&self, id: &OperationId, error: impl Into<String>) -> Result<SyncOperation> {
        let _guard = self.write_lock.lock().await;
        let retries = self.require(id).await?.retries.saturating_add(1);
        self.apply(
            id,
            OperationState::Failed,
            MarkExtra::retries(retries).with_error(error),
        )
        .await
    }

    async fn apply(
        &self,
        id: &OperationId,
        state: OperationState,
        extra: MarkExtra,
    ) -> Result<SyncOperation> {
        let mut op = self.require(id).await?;

        if op.state != state && !op.state.can_transition_to(state) {
            return Err(Error::InvalidInput(format!(
                "operation {} cannot move from {} to {}",
                id, op.state, state
            )));
        }

        if let Some(change) = extra.change {
            if change.entity() != op.change.entity()
                || change.operation_type() != op.change.operation_type()
            {
                return Err(Error::InvalidInput(format!(
                    "replacement for {} must be a {} {}",
                    id,
                    op.change.operation_type(),
                    op.change.entity()
                )));
            }
            op.change = change;
        }
        if let Some(retries) = extra.retries {
            op.retries = retries;
        }
        if let Some(last_error) = extra.last_error {
            op.last_error = last_error;
        }
        op.state = state;

        self.store.put_record(&op).await?;
        Ok(op)
    }

    /// Delete an operation; used for synced and discarded operations.
    pub async fn remove(&self, id: &OperationId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .delete(Collection::SyncOperations, id.as_str())
            .await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let count = |state: OperationState| {
            let query = Query::equals("state", state.as_str());
            let store = &self.store;
            async move { store.count(Collection::SyncOperations, &query).await }
        };

        Ok(QueueStatus {
            pending: count(OperationState::Pending).await?,
            syncing: count(OperationState::Syncing).await?,
            failed: count(OperationState::Failed).await?,
            conflict: count(OperationState::Conflict).await?,
        })
    }

    /// Put operations left in `syncing` by an interrupted pass back to
    /// `pending`. Returns how many were recovered.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let query = Query::equals("state", OperationState::Syncing.as_str());
        let stuck = self.query_operations(&query).await?;

        for op in &stuck {
            self.mark(&op.id, OperationState::Pending, MarkExtra::default())
                .await?;
        }
        if !stuck.is_empty() {
            info!("Recovered {} interrupted operations", stuck.len());
        }
        Ok(stuck.len())
    }

    /// Decode query results one by one.
    ///
    /// A record that fails to decode (written by an incompatible build, or
    /// corrupted) is skipped and parked as `failed` with the decode error, so
    /// it shows up in [`status`](Self::status) without blocking the rest of
    /// the queue.
    async fn query_operations(&self, query: &Query) -> Result<Vec<SyncOperation>> {
        let documents = self.store.query(Collection::SyncOperations, query).await?;

        let mut operations = Vec::with_capacity(documents.len());
        for document in documents {
            match SyncOperation::from_document(document.clone()) {
                Ok(op) => operations.push(op),
                Err(e) => {
                    warn!("Skipping unreadable sync operation {}: {}", document.id, e);
                    self.quarantine(document, &e).await;
                }
            }
        }
        Ok(operations)
    }

    async fn quarantine(&self, mut document: Document, error: &Error) {
        let failed = Value::from(OperationState::Failed.as_str());
        let message = Value::from(error.to_string());
        let Some(fields) = document.body.as_object_mut() else {
            return;
        };
        if fields.get("state") == Some(&failed) && fields.get("last_error") == Some(&message) {
            return;
        }
        fields.insert("state".to_string(), failed);
        fields.insert("last_error".to_string(), message);

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.store.put(Collection::SyncOperations, document).await {
            warn!("Could not park unreadable sync operation: {}", e);
        }
    }

    async fn require(&self, id: &OperationId) -> Result<SyncOperation> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync operation {}", id)))
    }

    /// Strictly increasing creation time, so FIFO order never ties.
    fn next_created_at(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let mut last = self
            .last_created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let micros = now.max(*last + 1);
        *last = micros;
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limeaura_common::{EntityKind, OperationType};
    use limeaura_storage::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn queue() -> SyncQueue<MemoryStore> {
        SyncQueue::new(Arc::new(MemoryStore::new()))
    }

    fn update_title(title: &str) -> Change {
        Change::from_parts(
            EntityKind::Task,
            OperationType::Update,
            Some(json!({ "title": title })),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let queue = queue();
        let op = queue.enqueue("t-1", update_title("Ship it")).await.unwrap();

        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.retries, 0);
        assert_eq!(queue.get(&op.id).await.unwrap(), Some(op));
    }

    #[tokio::test]
    async fn test_enqueue_ids_distinct_and_times_increasing() {
        let queue = queue();
        let mut ids = HashSet::new();
        let mut last = None;

        for i in 0..50 {
            let op = queue
                .enqueue(format!("t-{}", i), Change::delete(EntityKind::Task))
                .await
                .unwrap();
            if let Some(previous) = last {
                assert!(op.created_at > previous);
            }
            last = Some(op.created_at);
            ids.insert(op.id);
        }
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn test_pending_and_failed_fifo() {
        let queue = queue();
        let a = queue.enqueue("t-1", update_title("a")).await.unwrap();
        let b = queue.enqueue("t-2", update_title("b")).await.unwrap();
        let c = queue.enqueue("t-3", update_title("c")).await.unwrap();

        queue
            .mark(&a.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();
        queue.mark_failed(&a.id, "timeout").await.unwrap();
        queue
            .mark(&b.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();
        queue
            .mark(&b.id, OperationState::Conflict, MarkExtra::default())
            .await
            .unwrap();

        let due: Vec<_> = queue
            .pending_and_failed()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(due, vec![a.id.clone(), c.id.clone()]);

        let conflicts = queue.conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].id, b.id);
    }

    #[tokio::test]
    async fn test_mark_failed_increments_retries() {
        let queue = queue();
        let op = queue.enqueue("t-1", update_title("x")).await.unwrap();

        queue
            .mark(&op.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();
        let failed = queue.mark_failed(&op.id, "HTTP 500").await.unwrap();
        assert_eq!(failed.state, OperationState::Failed);
        assert_eq!(failed.retries, 1);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 500"));

        queue
            .mark(&op.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();
        let failed = queue.mark_failed(&op.id, "HTTP 502").await.unwrap();
        assert_eq!(failed.retries, 2);
    }

    #[tokio::test]
    async fn test_mark_rejects_synced_and_illegal_transitions() {
        let queue = queue();
        let op = queue.enqueue("t-1", update_title("x")).await.unwrap();

        let synced = queue
            .mark(&op.id, OperationState::Synced, MarkExtra::default())
            .await;
        assert!(matches!(synced, Err(Error::InvalidInput(_))));

        let conflict = queue
            .mark(&op.id, OperationState::Conflict, MarkExtra::default())
            .await;
        assert!(matches!(conflict, Err(Error::InvalidInput(_))));

        let stored = queue.get(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OperationState::Pending);
    }

    #[tokio::test]
    async fn test_mark_unknown_id_is_not_found() {
        let queue = queue();
        let missing = OperationId::new("nope").unwrap();
        let result = queue
            .mark(&missing, OperationState::Syncing, MarkExtra::default())
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mark_replacement_change_must_match_kind() {
        let queue = queue();
        let op = queue.enqueue("t-1", update_title("x")).await.unwrap();
        queue
            .mark(&op.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();

        let wrong = MarkExtra::default().with_change(Change::delete(EntityKind::Task));
        let result = queue.mark(&op.id, OperationState::Conflict, wrong).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_remove_and_status() {
        let queue = queue();
        let a = queue.enqueue("t-1", update_title("a")).await.unwrap();
        let b = queue.enqueue("t-2", update_title("b")).await.unwrap();
        queue
            .mark(&b.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(
            status,
            QueueStatus {
                pending: 1,
                syncing: 1,
                failed: 0,
                conflict: 0
            }
        );

        queue.remove(&a.id).await.unwrap();
        queue.remove(&b.id).await.unwrap();
        assert!(queue.status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let queue = queue();
        let a = queue.enqueue("t-1", update_title("a")).await.unwrap();
        queue
            .mark(&a.id, OperationState::Syncing, MarkExtra::default())
            .await
            .unwrap();

        assert_eq!(queue.recover_interrupted().await.unwrap(), 1);
        let recovered = queue.get(&a.id).await.unwrap().unwrap();
        assert_eq!(recovered.state, OperationState::Pending);
        assert_eq!(recovered.created_at, a.created_at);

        assert_eq!(queue.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_parked_and_skipped() {
        let queue = queue();
        queue
            .store()
            .put(
                Collection::SyncOperations,
                Document::new(
                    "old-op",
                    json!({
                        "id": "old-op",
                        "type": "CREATE",
                        "entity": "task",
                        "entity_id": "t-0",
                        "data": { "name": "Legacy draft" },
                        "state": "pending",
                        "created_at": 1
                    }),
                ),
            )
            .await
            .unwrap();
        let valid = queue.enqueue("t-1", update_title("a")).await.unwrap();

        let due = queue.pending_and_failed().await.unwrap();
        assert_eq!(due, vec![valid]);

        let parked = queue
            .store()
            .get(Collection::SyncOperations, "old-op")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.field("state"), Some(&json!("failed")));
        let reason = parked.field("last_error").and_then(Value::as_str).unwrap();
        assert!(reason.contains("project_id"));

        let status = queue.status().await.unwrap();
        assert_eq!((status.pending, status.failed), (1, 1));
        assert_eq!(queue.pending_and_failed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_quota_exceeded() {
        let queue = SyncQueue::new(Arc::new(MemoryStore::with_quota(1)));
        queue.enqueue("t-1", update_title("a")).await.unwrap();

        let err = queue.enqueue("t-2", update_title("b")).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(queue.pending_and_failed().await.unwrap().len(), 1);
    }
}
