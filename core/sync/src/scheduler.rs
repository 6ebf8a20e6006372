//! Sync scheduling: funnels triggers into drain passes.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

use limeaura_common::{Error, Result};
use limeaura_storage::LocalStore;

use crate::config::SyncConfig;
use crate::engine::{PassOutcome, SyncEngine};
use crate::remote::RemoteApi;
use crate::retry::Backoff;

/// What asked for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Enqueued,
    ConnectivityRestored,
    Manual,
    ConflictResolved,
    RetryTimer,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerReason::Enqueued => "enqueued",
            TriggerReason::ConnectivityRestored => "connectivity restored",
            TriggerReason::Manual => "manual",
            TriggerReason::ConflictResolved => "conflict resolved",
            TriggerReason::RetryTimer => "retry timer",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum SchedulerMessage {
    Trigger(TriggerReason),
    Shutdown,
}

/// Sender side of the scheduler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    tx: mpsc::Sender<SchedulerMessage>,
}

impl SyncScheduler {
    /// Create a scheduler for `engine`. The returned handle must be spawned.
    ///
    /// Connectivity is subscribed here, so a reconnect between this call and
    /// the first poll of the handle still triggers a pass.
    pub fn new<S, R>(engine: Arc<SyncEngine<S, R>>, config: &SyncConfig) -> (Self, SchedulerHandle<S, R>)
    where
        S: LocalStore + ?Sized,
        R: RemoteApi + ?Sized,
    {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let online = engine.connectivity().subscribe();
        let backoff = config
            .retry_backoff
            .then(|| Backoff::new(config.retry_config()));

        (
            Self { tx },
            SchedulerHandle {
                engine,
                rx,
                online,
                backoff,
            },
        )
    }

    /// Ask for a pass without waiting for it.
    ///
    /// Returns `false` only when the scheduler has stopped. A full channel
    /// already guarantees a pending pass, so the trigger is dropped.
    pub fn trigger(&self, reason: TriggerReason) -> bool {
        match self.tx.try_send(SchedulerMessage::Trigger(reason)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Trigger ({}) coalesced with queued triggers", reason);
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Trigger ({}) ignored: scheduler stopped", reason);
                false
            }
        }
    }

    /// Stop the scheduler after any running pass.
    ///
    /// # Errors
    /// - Scheduler already stopped
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(SchedulerMessage::Shutdown)
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Background side of the scheduler.
pub struct SchedulerHandle<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> {
    engine: Arc<SyncEngine<S, R>>,
    rx: mpsc::Receiver<SchedulerMessage>,
    online: watch::Receiver<bool>,
    backoff: Option<Backoff>,
}

impl<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> SchedulerHandle<S, R> {
    /// Run the scheduler loop until shutdown. Spawn this in a tokio task.
    ///
    /// Passes run inline, so at most one is in flight. Triggers that arrive
    /// while a pass runs are discarded once it finishes.
    pub async fn run(mut self) {
        let mut retry_at: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            let reason = tokio::select! {
                message = self.rx.recv() => match message {
                    Some(SchedulerMessage::Trigger(reason)) => reason,
                    Some(SchedulerMessage::Shutdown) | None => break,
                },

                Ok(()) = self.online.changed() => {
                    if !*self.online.borrow_and_update() {
                        continue;
                    }
                    TriggerReason::ConnectivityRestored
                }

                _ = retry_timer(retry_at) => {
                    retry_at = None;
                    TriggerReason::RetryTimer
                }
            };

            debug!("Sync triggered: {}", reason);
            let outcome = self.engine.run_pass().await;

            if self.discard_stale_triggers() {
                break;
            }
            if matches!(outcome, Ok(PassOutcome::Completed(_))) {
                // The pass already ran online; a reconnect during it is stale too.
                self.online.borrow_and_update();
            }

            match outcome {
                Ok(PassOutcome::Completed(report)) => {
                    if let Some(backoff) = self.backoff.as_mut() {
                        if report.failed > 0 {
                            let delay = backoff.next_delay();
                            info!(
                                "{} operations failed, retrying in {:?} (streak {})",
                                report.failed,
                                delay,
                                backoff.streak()
                            );
                            retry_at = Some(Instant::now() + delay);
                        } else {
                            backoff.reset();
                            retry_at = None;
                        }
                    }
                }
                Ok(PassOutcome::Skipped(reason)) => {
                    debug!("Sync pass skipped: {:?}", reason);
                }
                Err(e) => {
                    error!("Sync pass failed: {}", e);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Drop triggers queued during the pass. Returns `true` if a shutdown
    /// was among them.
    fn discard_stale_triggers(&mut self) -> bool {
        let mut discarded = 0;
        while let Ok(message) = self.rx.try_recv() {
            match message {
                SchedulerMessage::Trigger(_) => discarded += 1,
                SchedulerMessage::Shutdown => return true,
            }
        }
        if discarded > 0 {
            debug!("Discarded {} triggers received during the pass", discarded);
        }
        false
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
