//! Durable, deduplicated retry queue with exponential backoff.
//!
//! Holds at most one pending item per session: a newer enqueue of either
//! operation replaces the older one, so a delete queued after an upload
//! wins and vice versa. Items are persisted to the local store after every
//! mutation. Mutations are serialized by an internal lock because the
//! queue is fed from the periodic timer, manual syncs and post-save pushes.

use crate::config::RetryConfig;
use crate::error::CloudResult;
use crate::types::{now_millis, QueueOperation, SyncQueueItem};
use std::future::Future;
use std::sync::Arc;
use tabsync_storage::{keys, KvStore, KvStoreExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const JITTER_MIN: f64 = 0.9;
const JITTER_MAX: f64 = 1.1;

/// Result of recording a failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum FailureOutcome {
    /// Backing off until `next_retry_at`.
    Rescheduled { next_retry_at: i64 },
    /// Retries exhausted; the item has been removed.
    Dropped(SyncQueueItem),
    /// The item was replaced or removed while it was being processed.
    Superseded,
}

/// Totals from one [`RetryQueue::process_queue`] drain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: Vec<SyncQueueItem>,
    pub errors: Vec<String>,
}

/// Backoff delay in milliseconds after `retry_count` failures.
///
/// `min(initial * multiplier^retry_count, max) * jitter`.
pub fn backoff_delay_ms(config: &RetryConfig, retry_count: u32, jitter: f64) -> i64 {
    let initial_ms = (config.initial_delay_secs * 1000) as f64;
    let max_ms = (config.max_delay_secs * 1000) as f64;
    let exp = config.multiplier.powi(retry_count as i32);
    let base = (initial_ms * exp).min(max_ms);
    (base * jitter.clamp(JITTER_MIN, JITTER_MAX)) as i64
}

fn random_jitter() -> f64 {
    rand::random_range(JITTER_MIN..=JITTER_MAX)
}

pub struct RetryQueue {
    kv: Arc<dyn KvStore>,
    config: RetryConfig,
    lock: Mutex<()>,
}

impl RetryQueue {
    pub fn new(kv: Arc<dyn KvStore>, config: RetryConfig) -> Self {
        Self {
            kv,
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn load(&self) -> CloudResult<Vec<SyncQueueItem>> {
        Ok(self.kv.get_json(keys::SYNC_QUEUE)?.unwrap_or_default())
    }

    fn save(&self, items: &[SyncQueueItem]) -> CloudResult<()> {
        if items.is_empty() {
            self.kv.remove(keys::SYNC_QUEUE)?;
        } else {
            self.kv.set_json(keys::SYNC_QUEUE, items)?;
        }
        Ok(())
    }

    /// Inserts or replaces the pending item for `session_id`.
    pub async fn enqueue(
        &self,
        operation: QueueOperation,
        session_id: &str,
    ) -> CloudResult<SyncQueueItem> {
        self.enqueue_at(operation, session_id, now_millis()).await
    }

    pub async fn enqueue_at(
        &self,
        operation: QueueOperation,
        session_id: &str,
        now: i64,
    ) -> CloudResult<SyncQueueItem> {
        let _guard = self.lock.lock().await;
        let mut items = self.load()?;
        items.retain(|i| i.session_id != session_id);

        let item = SyncQueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            session_id: session_id.to_string(),
            queued_at: now,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
        };
        items.push(item.clone());
        self.save(&items)?;

        debug!("queued {operation} for session {session_id}");
        Ok(item)
    }

    /// Earliest-queued item whose backoff has elapsed.
    pub async fn get_next_item(&self) -> CloudResult<Option<SyncQueueItem>> {
        self.get_next_item_at(now_millis()).await
    }

    pub async fn get_next_item_at(&self, now: i64) -> CloudResult<Option<SyncQueueItem>> {
        let _guard = self.lock.lock().await;
        let items = self.load()?;
        Ok(items
            .into_iter()
            .filter(|i| i.next_retry_at <= now)
            .min_by_key(|i| i.queued_at))
    }

    /// Records a failed attempt and schedules the next one.
    pub async fn mark_failed(&self, item: &SyncQueueItem, error: &str) -> CloudResult<FailureOutcome> {
        self.mark_failed_at(item, error, now_millis(), random_jitter()).await
    }

    pub async fn mark_failed_at(
        &self,
        item: &SyncQueueItem,
        error: &str,
        now: i64,
        jitter: f64,
    ) -> CloudResult<FailureOutcome> {
        let _guard = self.lock.lock().await;
        let mut items = self.load()?;

        let Some(pos) = items.iter().position(|i| i.id == item.id) else {
            return Ok(FailureOutcome::Superseded);
        };

        let entry = &mut items[pos];
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());

        if entry.retry_count >= self.config.max_retries {
            let dropped = items.remove(pos);
            self.save(&items)?;
            warn!(
                "dropping queued {} for session {} after {} failures: {error}",
                dropped.operation, dropped.session_id, dropped.retry_count
            );
            return Ok(FailureOutcome::Dropped(dropped));
        }

        let delay = backoff_delay_ms(&self.config, entry.retry_count, jitter);
        entry.next_retry_at = now + delay;
        let next_retry_at = entry.next_retry_at;
        debug!(
            "queued {} for session {} failed (attempt {}), retrying in {}ms",
            entry.operation, entry.session_id, entry.retry_count, delay
        );
        self.save(&items)?;

        Ok(FailureOutcome::Rescheduled { next_retry_at })
    }

    /// Removes a completed item. Items replaced in the meantime are kept.
    pub async fn complete(&self, item: &SyncQueueItem) -> CloudResult<()> {
        let _guard = self.lock.lock().await;
        let mut items = self.load()?;
        let before = items.len();
        items.retain(|i| i.id != item.id);
        if items.len() != before {
            self.save(&items)?;
        }
        Ok(())
    }

    /// Removes whatever is pending for `session_id`.
    pub async fn discard(&self, session_id: &str) -> CloudResult<()> {
        let _guard = self.lock.lock().await;
        let mut items = self.load()?;
        let before = items.len();
        items.retain(|i| i.session_id != session_id);
        if items.len() != before {
            self.save(&items)?;
        }
        Ok(())
    }

    /// Drains every ready item, one at a time, through `handler`.
    ///
    /// Stops once no item is ready; failed items are backing off by then.
    pub async fn process_queue<F, Fut>(&self, mut handler: F) -> CloudResult<DrainReport>
    where
        F: FnMut(SyncQueueItem) -> Fut,
        Fut: Future<Output = CloudResult<()>>,
    {
        let mut report = DrainReport::default();

        while let Some(item) = self.get_next_item().await? {
            match handler(item.clone()).await {
                Ok(()) => {
                    self.complete(&item).await?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("{} {}: {e}", item.operation, item.session_id));
                    if let FailureOutcome::Dropped(dropped) = self.mark_failed(&item, &e.to_string()).await? {
                        report.dropped.push(dropped);
                    }
                }
            }
        }

        if report.succeeded + report.failed > 0 {
            info!(
                "retry queue drained: {} succeeded, {} failed, {} dropped",
                report.succeeded,
                report.failed,
                report.dropped.len()
            );
        }
        Ok(report)
    }

    pub async fn pending_count(&self) -> CloudResult<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.len())
    }

    pub async fn items(&self) -> CloudResult<Vec<SyncQueueItem>> {
        let _guard = self.lock.lock().await;
        self.load()
    }

    pub async fn clear(&self) -> CloudResult<()> {
        let _guard = self.lock.lock().await;
        self.kv.remove(keys::SYNC_QUEUE)?;
        Ok(())
    }
}
