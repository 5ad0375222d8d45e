//! Redelivery of unacknowledged items
//!
//! [`Redelivering`] wraps a backend that forgets an item once it has been
//! pulled (disk, Redis) and remembers every pulled item until it is
//! acknowledged. A periodic sweep pushes items that stayed unacknowledged
//! past the timeout back into the backend.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use mailsift_common::config::{AgingMode, RedeliveryConfig};
use mailsift_common::types::Timestamp;
use mailsift_common::{WorkItem, WorkItemId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueResult;
use crate::queue::{SharedQueue, WorkQueue};

struct Tracked {
    item: WorkItem,
    pulled_at: Timestamp,
}

/// Pulled items awaiting acknowledgement
pub struct RedeliveryTracker {
    entries: DashMap<WorkItemId, Tracked>,
    timeout: chrono::Duration,
    aging: AgingMode,
}

impl RedeliveryTracker {
    pub fn new(timeout: Duration, aging: AgingMode) -> Self {
        Self {
            entries: DashMap::new(),
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            aging,
        }
    }

    pub fn track(&self, item: WorkItem, pulled_at: Timestamp) {
        self.entries.insert(item.id, Tracked { item, pulled_at });
    }

    /// Stop tracking an item. Returns whether it was tracked.
    pub fn forget(&self, id: &WorkItemId) -> bool {
        self.entries.remove(id).is_some()
    }

    fn started_at(&self, tracked: &Tracked) -> Timestamp {
        match self.aging {
            AgingMode::PullTime => tracked.pulled_at,
            AgingMode::ItemCreation => tracked.item.created_at().unwrap_or(tracked.pulled_at),
        }
    }

    /// Remove and return every item older than the timeout at `now`
    pub fn expired(&self, now: Timestamp) -> Vec<WorkItem> {
        let ids: Vec<WorkItemId> = self
            .entries
            .iter()
            .filter(|entry| now - self.started_at(entry.value()) > self.timeout)
            .map(|entry| *entry.key())
            .collect();

        // An acknowledgement racing the sweep wins: remove() then yields nothing.
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|(_, tracked)| tracked.item)
            .collect()
    }

    /// Remove and return every tracked item regardless of age
    pub fn drain(&self) -> Vec<WorkItem> {
        let ids: Vec<WorkItemId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|(_, tracked)| tracked.item)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Queue decorator adding timeout-based redelivery
pub struct Redelivering {
    inner: SharedQueue,
    tracker: RedeliveryTracker,
}

impl Redelivering {
    pub fn new(inner: SharedQueue, timeout: Duration, aging: AgingMode) -> Self {
        Self {
            inner,
            tracker: RedeliveryTracker::new(timeout, aging),
        }
    }

    pub fn from_config(inner: SharedQueue, config: &RedeliveryConfig) -> Self {
        Self::new(inner, Duration::from_secs(config.timeout_secs), config.aging)
    }

    pub fn tracker(&self) -> &RedeliveryTracker {
        &self.tracker
    }

    /// Push every expired item back into the backend.
    ///
    /// Items that cannot be pushed stay tracked and are retried on the next
    /// sweep. Returns the number of items redelivered.
    pub async fn sweep_once(&self, now: Timestamp, cancel: &CancellationToken) -> usize {
        let mut redelivered = 0;
        for item in self.tracker.expired(now) {
            let id = item.id;
            match self.inner.push(item.clone(), cancel).await {
                Ok(()) => {
                    info!(%id, "Redelivered unacknowledged item");
                    redelivered += 1;
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(%id, error = %e, "Failed to redeliver item");
                    }
                    self.tracker.track(item, now);
                }
            }
        }
        redelivered
    }

    /// Push every unacknowledged item back into the backend.
    ///
    /// Returns the number of items returned.
    pub async fn return_unacknowledged(&self) -> usize {
        let mut returned = 0;
        for item in self.tracker.drain() {
            let id = item.id;
            match self.inner.push_now(item).await {
                Ok(()) => {
                    debug!(%id, "Returned unacknowledged item");
                    returned += 1;
                }
                Err(e) => error!(%id, error = %e, "Failed to return unacknowledged item"),
            }
        }
        returned
    }

    /// Run [`Self::sweep_once`] every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let count = this.sweep_once(Utc::now(), &cancel).await;
                        debug!(
                            redelivered = count,
                            tracked = this.tracker.len(),
                            "Redelivery sweep finished"
                        );
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Redelivery sweeper stopped");
        })
    }
}

#[async_trait]
impl WorkQueue for Redelivering {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> QueueResult<()> {
        self.inner.push(item, cancel).await
    }

    async fn pull(&self, cancel: &CancellationToken) -> QueueResult<WorkItem> {
        let item = self.inner.pull(cancel).await?;
        self.tracker.track(item.clone(), Utc::now());
        Ok(item)
    }

    async fn acknowledge(&self, id: WorkItemId) {
        self.tracker.forget(&id);
        self.inner.acknowledge(id).await;
    }

    /// Return in-flight items to the backend, then close it
    async fn close(&self) {
        let returned = self.return_unacknowledged().await;
        if returned > 0 {
            info!(count = returned, "Returned unacknowledged items before closing");
        }
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::disk::DiskQueue;
    use crate::memory::MemoryQueue;
    use mailsift_common::Origin;
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn item() -> WorkItem {
        WorkItem::new(
            "sender@example.com",
            vec!["rcpt@example.com".to_string()],
            Origin::new("mx.example.com", 25, "smtp"),
            b"Subject: hi\r\n\r\nbody".to_vec(),
        )
    }

    fn setup(aging: AgingMode) -> (Arc<MemoryQueue>, Redelivering) {
        let backend = Arc::new(MemoryQueue::new(16));
        let queue = Redelivering::new(backend.clone(), TIMEOUT, aging);
        (backend, queue)
    }

    fn after_timeout() -> Timestamp {
        Utc::now() + chrono::Duration::seconds(TIMEOUT.as_secs() as i64 + 1)
    }

    #[tokio::test]
    async fn test_unacknowledged_item_redelivered_exactly_once() {
        let (backend, queue) = setup(AgingMode::PullTime);
        let cancel = CancellationToken::new();
        let original = item();
        queue.push_now(original.clone()).await.unwrap();

        let pulled = queue.pull_now().await.unwrap();
        assert_eq!(pulled, original);
        assert_eq!(queue.tracker().len(), 1);

        // Not yet expired.
        assert_eq!(queue.sweep_once(Utc::now(), &cancel).await, 0);
        assert_eq!(backend.len(), 0);

        let later = after_timeout();
        assert_eq!(queue.sweep_once(later, &cancel).await, 1);
        assert_eq!(queue.sweep_once(later, &cancel).await, 0);
        assert_eq!(backend.len(), 1);

        let again = queue.pull_now().await.unwrap();
        assert_eq!(again, original);
        queue.acknowledge(again.id).await;
        assert!(queue.tracker().is_empty());
        assert_eq!(queue.sweep_once(after_timeout(), &cancel).await, 0);
    }

    #[tokio::test]
    async fn test_acknowledged_item_not_redelivered() {
        let (backend, queue) = setup(AgingMode::PullTime);
        queue.push_now(item()).await.unwrap();
        let pulled = queue.pull_now().await.unwrap();

        queue.acknowledge(pulled.id).await;
        // Late and repeated acks are harmless.
        queue.acknowledge(pulled.id).await;
        queue.acknowledge(uuid::Uuid::now_v7()).await;

        assert_eq!(
            queue.sweep_once(after_timeout(), &CancellationToken::new()).await,
            0
        );
        assert_eq!(backend.len(), 0);
    }

    #[test]
    fn test_pull_time_aging_ignores_item_age() {
        let tracker = RedeliveryTracker::new(TIMEOUT, AgingMode::PullTime);
        let old = item();
        let now = Utc::now() + chrono::Duration::hours(2);

        // Created long before, pulled just now.
        tracker.track(old, now);
        assert!(tracker.expired(now).is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_item_creation_aging_uses_id_timestamp() {
        let tracker = RedeliveryTracker::new(TIMEOUT, AgingMode::ItemCreation);
        let old = item();
        let now = Utc::now() + chrono::Duration::hours(2);

        tracker.track(old.clone(), now);
        assert_eq!(tracker.expired(now), vec![old]);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failed_redelivery_stays_tracked() {
        let (backend, queue) = setup(AgingMode::PullTime);
        queue.push_now(item()).await.unwrap();
        queue.pull_now().await.unwrap();
        backend.close().await;

        assert_eq!(
            queue.sweep_once(after_timeout(), &CancellationToken::new()).await,
            0
        );
        assert_eq!(queue.tracker().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_error_not_tracked() {
        let (_backend, queue) = setup(AgingMode::PullTime);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(queue.pull(&cancel).await, Err(QueueError::Cancelled)));
        assert!(queue.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_close_returns_unacknowledged_items() {
        let (backend, queue) = setup(AgingMode::PullTime);
        let held = item();
        queue.push_now(held.clone()).await.unwrap();
        queue.push_now(item()).await.unwrap();

        let pulled = queue.pull_now().await.unwrap();
        let acked = queue.pull_now().await.unwrap();
        queue.acknowledge(acked.id).await;
        assert_eq!(pulled, held);

        queue.close().await;
        assert!(queue.tracker().is_empty());
        // Closed backends still drain what they hold.
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.pull_now().await.unwrap(), held);
    }

    #[tokio::test]
    async fn test_in_flight_item_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let held = item();
        {
            let disk = Arc::new(DiskQueue::open(dir.path(), Duration::from_millis(50)).unwrap());
            let queue = Redelivering::new(disk, TIMEOUT, AgingMode::PullTime);
            queue.push_now(held.clone()).await.unwrap();
            queue.pull_now().await.unwrap();
            assert_eq!(queue.tracker().len(), 1);
            queue.close().await;
        }

        let reopened = DiskQueue::open(dir.path(), Duration::from_millis(50)).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
        assert_eq!(reopened.pull_now().await.unwrap(), held);
    }
}
