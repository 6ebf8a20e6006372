//! Conflict resolution for operations the remote rejected with a conflict.
//!
//! The engine never retries a conflicted operation. It stays in `conflict`
//! until the caller resolves it, directly or through a [`ConflictResolver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use limeaura_common::{Error, OperationId, Result};
use limeaura_storage::LocalStore;

use crate::operation::{Change, OperationState, SyncOperation};
use crate::queue::{MarkExtra, SyncQueue};

/// How to settle one conflicted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Send the local change again.
    KeepLocal,
    /// Drop the local change; the server state wins.
    AcceptServer,
    /// Send a merged change instead. Must have the same entity kind and
    /// operation type as the original.
    Merge(Change),
}

/// What happened to the operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// Back in the queue as pending.
    Requeued(SyncOperation),
    /// Removed from the queue.
    Discarded,
}

/// Decides conflicts in bulk. `None` leaves an operation in conflict.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, operation: &SyncOperation) -> Result<Option<Resolution>>;
}

/// Fixed policy applied to every conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    PreferLocal,
    PreferRemote,
}

#[async_trait]
impl ConflictResolver for ConflictStrategy {
    async fn resolve(&self, _operation: &SyncOperation) -> Result<Option<Resolution>> {
        Ok(Some(match self {
            ConflictStrategy::PreferLocal => Resolution::KeepLocal,
            ConflictStrategy::PreferRemote => Resolution::AcceptServer,
        }))
    }
}

/// Counts from a bulk resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub requeued: usize,
    pub discarded: usize,
    /// Left in conflict by the resolver, or failed to resolve.
    pub unresolved: usize,
}

/// Apply `resolution` to the conflicted operation `id`.
///
/// Requeued operations keep their id, `created_at` and retry count.
///
/// # Errors
/// - `NotFound` for an unknown id
/// - `InvalidInput` if the operation is not in conflict, or a merged change
///   does not match the original's entity kind and operation type
pub async fn apply_resolution<S: LocalStore + ?Sized>(
    queue: &SyncQueue<S>,
    id: &OperationId,
    resolution: Resolution,
) -> Result<ResolutionOutcome> {
    let op = queue
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("sync operation {}", id)))?;

    if op.state != OperationState::Conflict {
        return Err(Error::InvalidInput(format!(
            "operation {} is {}, not in conflict",
            id, op.state
        )));
    }

    let outcome = match resolution {
        Resolution::AcceptServer => {
            queue.remove(id).await?;
            ResolutionOutcome::Discarded
        }
        Resolution::KeepLocal => {
            let op = queue
                .mark(id, OperationState::Pending, MarkExtra::default().clear_error())
                .await?;
            ResolutionOutcome::Requeued(op)
        }
        Resolution::Merge(change) => {
            let extra = MarkExtra::default().with_change(change).clear_error();
            let op = queue.mark(id, OperationState::Pending, extra).await?;
            ResolutionOutcome::Requeued(op)
        }
    };

    info!(
        "Resolved conflict for {}: {}",
        op,
        match outcome {
            ResolutionOutcome::Requeued(_) => "requeued",
            ResolutionOutcome::Discarded => "discarded",
        }
    );
    Ok(outcome)
}

/// Run `resolver` over every current conflict, oldest first.
///
/// A resolver error or a failed resolution leaves that operation in conflict
/// and moves on to the next one.
///
/// # Errors
/// - Store unavailable while listing conflicts
pub async fn resolve_all<S: LocalStore + ?Sized>(
    queue: &SyncQueue<S>,
    resolver: &dyn ConflictResolver,
) -> Result<ResolutionSummary> {
    let mut summary = ResolutionSummary::default();

    for op in queue.conflicts().await? {
        let resolution = match resolver.resolve(&op).await {
            Ok(Some(resolution)) => resolution,
            Ok(None) => {
                debug!("Resolver left {} in conflict", op);
                summary.unresolved += 1;
                continue;
            }
            Err(e) => {
                warn!("Resolver failed for {}: {}", op, e);
                summary.unresolved += 1;
                continue;
            }
        };

        match apply_resolution(queue, &op.id, resolution).await {
            Ok(ResolutionOutcome::Requeued(_)) => summary.requeued += 1,
            Ok(ResolutionOutcome::Discarded) => summary.discarded += 1,
            Err(e) => {
                warn!("Could not resolve {}: {}", op, e);
                summary.unresolved += 1;
            }
        }
    }

    Ok(summary)
}
