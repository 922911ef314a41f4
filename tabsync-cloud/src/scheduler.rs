//! Background sync loop.
//!
//! Every trigger (the periodic timer, the manual sync button, post-save
//! pushes) goes through one [`SyncHandle`]; the [`SyncScheduler`] runs the
//! requested engine operation. The engine's own locks keep overlapping
//! triggers serialized, so handles can be cloned freely.

use crate::error::{CloudError, CloudResult};
use crate::sync_engine::ManifestSyncEngine;
use crate::types::SyncCommand;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Handle for sending commands to the scheduler.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    async fn send(&self, command: SyncCommand) -> CloudResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| CloudError::Config("sync scheduler not running".to_string()))
    }

    pub async fn sync_now(&self) -> CloudResult<()> {
        self.send(SyncCommand::SyncNow).await
    }

    pub async fn push_session(&self, session_id: impl Into<String>) -> CloudResult<()> {
        self.send(SyncCommand::PushSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn delete_session(&self, session_id: impl Into<String>) -> CloudResult<()> {
        self.send(SyncCommand::DeleteSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn process_queue(&self) -> CloudResult<()> {
        self.send(SyncCommand::ProcessQueue).await
    }

    pub async fn stop(&self) -> CloudResult<()> {
        self.send(SyncCommand::Stop).await
    }
}

pub struct SyncScheduler {
    engine: Arc<ManifestSyncEngine>,
    command_rx: mpsc::Receiver<SyncCommand>,
    interval: Duration,
}

/// Creates a scheduler for `engine` and the handle that drives it.
pub fn create_sync_scheduler(
    engine: Arc<ManifestSyncEngine>,
    interval: Duration,
) -> (SyncHandle, SyncScheduler) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let handle = SyncHandle { command_tx };
    let scheduler = SyncScheduler {
        engine,
        command_rx,
        interval,
    };
    (handle, scheduler)
}

/// Creates a scheduler ticking every `sync_interval_secs` of the engine's
/// config.
pub fn create_configured_sync_scheduler(
    engine: Arc<ManifestSyncEngine>,
) -> (SyncHandle, SyncScheduler) {
    // A zero period would panic in `tokio::time::interval`.
    let interval = Duration::from_secs(engine.config().sync_interval_secs.max(1));
    create_sync_scheduler(engine, interval)
}

/// Not-ready states are expected on a timer tick and only logged at debug.
fn log_outcome(what: &str, result: CloudResult<()>) {
    match result {
        Ok(()) => {}
        Err(e @ (CloudError::Locked | CloudError::NotConnected | CloudError::NotConfigured)) => {
            debug!("skipping {what}: {e}");
        }
        Err(e) if e.is_auth() => error!("{what} needs the account reconnected: {e}"),
        Err(e) => warn!("{what} failed: {e}"),
    }
}

impl SyncScheduler {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs until [`SyncCommand::Stop`] or every handle is dropped.
    pub async fn run(mut self) {
        info!("sync scheduler started, interval {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.engine.is_unlocked().await {
                        log_outcome("periodic sync", self.engine.perform_full_sync().await.map(|_| ()));
                    } else {
                        debug!("engine locked, periodic sync skipped");
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::SyncNow) => {
                            log_outcome("manual sync", self.engine.perform_full_sync().await.map(|_| ()));
                        }
                        Some(SyncCommand::PushSession { session_id }) => {
                            log_outcome(
                                "session push",
                                self.engine.push_session(&session_id).await.map(|_| ()),
                            );
                        }
                        Some(SyncCommand::DeleteSession { session_id }) => {
                            log_outcome(
                                "session delete",
                                self.engine.delete_session_from_cloud(&session_id).await.map(|_| ()),
                            );
                        }
                        Some(SyncCommand::ProcessQueue) => {
                            log_outcome("queue drain", self.engine.process_queue().await.map(|_| ()));
                        }
                        Some(SyncCommand::Stop) => {
                            info!("sync scheduler stopping");
                            break;
                        }
                        None => {
                            info!("command channel closed, stopping sync scheduler");
                            break;
                        }
                    }
                }
            }
        }

        info!("sync scheduler stopped");
    }
}
