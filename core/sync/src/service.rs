//! Caller-facing offline sync service.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use limeaura_common::{OperationId, Result};
use limeaura_storage::LocalStore;

use crate::config::SyncConfig;
use crate::conflict::{
    apply_resolution, resolve_all, ConflictResolver, Resolution, ResolutionOutcome,
    ResolutionSummary,
};
use crate::connectivity::Connectivity;
use crate::engine::{PassOutcome, SyncEngine};
use crate::operation::{Change, SyncOperation};
use crate::queue::{QueueStatus, SyncQueue};
use crate::remote::RemoteApi;
use crate::scheduler::{SyncScheduler, TriggerReason};

/// Offline-first mutation queue with background sync.
///
/// Owns the queue, the engine and the scheduler task. Mutations are
/// persisted before [`queue_operation`](Self::queue_operation) returns and
/// are sent whenever connectivity allows.
pub struct OfflineSync<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> {
    queue: Arc<SyncQueue<S>>,
    engine: Arc<SyncEngine<S, R>>,
    scheduler: SyncScheduler,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, R> OfflineSync<S, R>
where
    S: LocalStore + ?Sized + 'static,
    R: RemoteApi + ?Sized + 'static,
{
    /// Recover interrupted operations and start the scheduler.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Store unavailable during recovery
    pub async fn start(
        store: Arc<S>,
        remote: Arc<R>,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(SyncQueue::new(store));
        let recovered = queue.recover_interrupted().await?;

        let engine = Arc::new(SyncEngine::new(queue.clone(), remote, connectivity));
        let (scheduler, handle) = SyncScheduler::new(engine.clone(), config);
        let task = tokio::spawn(handle.run());

        info!(
            "Offline sync started ({} store, {} remote)",
            queue.store().name(),
            engine.remote().name()
        );
        if recovered > 0 {
            scheduler.trigger(TriggerReason::Manual);
        }

        Ok(Self {
            queue,
            engine,
            scheduler,
            task: Mutex::new(Some(task)),
        })
    }
}

impl<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> OfflineSync<S, R> {
    /// Persist a mutation and schedule a sync.
    ///
    /// # Errors
    /// - Store unavailable (quota exceeded, database error)
    pub async fn queue_operation(
        &self,
        entity_id: impl Into<String>,
        change: Change,
    ) -> Result<SyncOperation> {
        let op = self.queue.enqueue(entity_id, change).await?;
        self.scheduler.trigger(TriggerReason::Enqueued);
        Ok(op)
    }

    /// Schedule a sync pass. Idempotent while one is pending or running.
    pub fn trigger_sync(&self) {
        self.scheduler.trigger(TriggerReason::Manual);
    }

    /// Run a pass now and wait for it.
    pub async fn sync_now(&self) -> Result<PassOutcome> {
        self.engine.run_pass().await
    }

    pub async fn pending_and_failed(&self) -> Result<Vec<SyncOperation>> {
        self.queue.pending_and_failed().await
    }

    pub async fn conflicts(&self) -> Result<Vec<SyncOperation>> {
        self.queue.conflicts().await
    }

    pub async fn get(&self, id: &OperationId) -> Result<Option<SyncOperation>> {
        self.queue.get(id).await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.queue.status().await
    }

    pub fn connectivity(&self) -> &Connectivity {
        self.engine.connectivity()
    }

    /// Settle one conflicted operation. Requeued operations are synced on
    /// the next pass, which is triggered here.
    pub async fn resolve_conflict(
        &self,
        id: &OperationId,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome> {
        let outcome = apply_resolution(&self.queue, id, resolution).await?;
        if matches!(outcome, ResolutionOutcome::Requeued(_)) {
            self.scheduler.trigger(TriggerReason::ConflictResolved);
        }
        Ok(outcome)
    }

    /// Run `resolver` over every current conflict.
    pub async fn resolve_conflicts_with(
        &self,
        resolver: &dyn ConflictResolver,
    ) -> Result<ResolutionSummary> {
        let summary = resolve_all(&self.queue, resolver).await?;
        if summary.requeued > 0 {
            self.scheduler.trigger(TriggerReason::ConflictResolved);
        }
        Ok(summary)
    }

    /// Stop the scheduler and wait for its task. Safe to call twice.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler already stopped: {}", e);
        }
        if let Err(e) = task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        info!("Offline sync stopped");
        Ok(())
    }
}
