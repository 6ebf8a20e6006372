//! Core sync engine: drains the operation queue against the remote API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use limeaura_common::Result;
use limeaura_storage::LocalStore;

use crate::connectivity::Connectivity;
use crate::operation::{OperationState, SyncOperation};
use crate::queue::{MarkExtra, SyncQueue};
use crate::remote::{RemoteApi, RemoteRequest};

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass is in flight.
    Busy,
    Offline,
}

/// Counts for one completed pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub conflicts: usize,
    /// Operations that failed, including ones whose state could not be stored.
    pub failed: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

impl PassOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            PassOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PassOutcome::Skipped(_))
    }
}

/// Result of sending one operation.
enum Sent {
    Synced,
    Conflict,
    Failed,
}

/// Clears the busy flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sends queued operations to the remote, one at a time, oldest first.
///
/// At most one pass runs at a time; a concurrent call returns
/// [`PassOutcome::Skipped`] instead of waiting.
pub struct SyncEngine<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> {
    queue: Arc<SyncQueue<S>>,
    remote: Arc<R>,
    connectivity: Connectivity,
    busy: AtomicBool,
}

impl<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> SyncEngine<S, R> {
    pub fn new(queue: Arc<SyncQueue<S>>, remote: Arc<R>, connectivity: Connectivity) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            busy: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue<S>> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Whether a pass is currently running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run one drain pass over the pending and failed operations.
    ///
    /// Failures of individual operations are recorded on the operation and
    /// never abort the pass.
    ///
    /// # Errors
    /// - Store unavailable while listing the queue
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Some(_guard) = PassGuard::acquire(&self.busy) else {
            debug!("Sync pass already running, skipping");
            return Ok(PassOutcome::Skipped(SkipReason::Busy));
        };

        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync pass");
            return Ok(PassOutcome::Skipped(SkipReason::Offline));
        }

        let start = Instant::now();

        // No other pass is running, so anything still `syncing` was stranded
        // by an earlier pass whose state write failed.
        if let Err(e) = self.queue.recover_interrupted().await {
            warn!("Could not sweep stranded operations: {}", e);
        }

        let operations = self.queue.pending_and_failed().await.inspect_err(|e| {
            error!("Failed to read sync queue: {}", e);
        })?;

        let mut report = SyncReport::default();
        if operations.is_empty() {
            debug!("Sync queue empty");
            return Ok(PassOutcome::Completed(report));
        }

        info!(
            "Starting sync pass: {} operations via {}",
            operations.len(),
            self.remote.name()
        );

        for op in operations {
            report.attempted += 1;
            match self.sync_operation(&op).await {
                Sent::Synced => report.synced += 1,
                Sent::Conflict => report.conflicts += 1,
                Sent::Failed => report.failed += 1,
            }
        }

        report.duration = start.elapsed();
        info!(
            "Sync pass completed: {} synced, {} conflicts, {} failed in {:?}",
            report.synced, report.conflicts, report.failed, report.duration
        );
        Ok(PassOutcome::Completed(report))
    }

    async fn sync_operation(&self, op: &SyncOperation) -> Sent {
        if let Err(e) = self
            .queue
            .mark(&op.id, OperationState::Syncing, MarkExtra::default())
            .await
        {
            warn!("Could not mark {} syncing: {}", op, e);
            return Sent::Failed;
        }

        let result = match RemoteRequest::for_operation(op) {
            Ok(request) => {
                debug!("Sending {} for {}", request, op);
                self.remote.execute(&request).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                debug!(
                    "{} confirmed with HTTP {}: {:?}",
                    op, response.status, response.body
                );
                match self.queue.remove(&op.id).await {
                    Ok(()) => Sent::Synced,
                    Err(e) => {
                        error!("Synced {} but could not remove it: {}", op, e);
                        self.release(op).await;
                        Sent::Failed
                    }
                }
            }
            Err(e) if e.is_conflict() => {
                warn!("Conflict for {}: {}", op, e);
                let extra = MarkExtra::default().with_error(e.to_string());
                match self.queue.mark(&op.id, OperationState::Conflict, extra).await {
                    Ok(_) => Sent::Conflict,
                    Err(store_err) => {
                        error!("Could not mark {} as conflict: {}", op, store_err);
                        self.release(op).await;
                        Sent::Failed
                    }
                }
            }
            Err(e) => {
                warn!("Sync failed for {} (attempt {}): {}", op, op.retries + 1, e);
                if let Err(store_err) = self.queue.mark_failed(&op.id, e.to_string()).await {
                    error!("Could not mark {} as failed: {}", op, store_err);
                    self.release(op).await;
                }
                Sent::Failed
            }
        }
    }

    /// Put an operation whose outcome could not be stored back to `pending`.
    /// If that write fails too, the sweep at the start of the next pass
    /// picks it up.
    async fn release(&self, op: &SyncOperation) {
        if let Err(e) = self
            .queue
            .mark(&op.id, OperationState::Pending, MarkExtra::default())
            .await
        {
            warn!("Could not return {} to pending: {}", op, e);
        }
    }
}
