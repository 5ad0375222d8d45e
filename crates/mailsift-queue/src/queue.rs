//! Work queue trait

use async_trait::async_trait;
use mailsift_common::{WorkItem, WorkItemId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::QueueResult;

/// Shared handle to a work queue backend
pub type SharedQueue = Arc<dyn WorkQueue>;

/// At-least-once work queue contract shared by every backend
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;

    /// Enqueue an item, waiting for capacity if the backend is full.
    ///
    /// When `cancel` fires before the item is committed the item is not
    /// enqueued and `QueueError::Cancelled` is returned.
    async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> QueueResult<()>;

    /// Remove and return one item, waiting until one is available.
    ///
    /// Returns `QueueError::Closed` once the backend is closed and drained,
    /// and `QueueError::Cancelled` when `cancel` fires. An item already taken
    /// from durable storage is never dropped on cancellation.
    async fn pull(&self, cancel: &CancellationToken) -> QueueResult<WorkItem>;

    /// Mark an item as processed. Unknown or repeated ids are ignored.
    async fn acknowledge(&self, id: WorkItemId);

    /// Stop accepting pushes and wake blocked callers. Idempotent.
    async fn close(&self);

    /// Push without a cancellation signal
    async fn push_now(&self, item: WorkItem) -> QueueResult<()> {
        self.push(item, &CancellationToken::new()).await
    }

    /// Pull without a cancellation signal
    async fn pull_now(&self) -> QueueResult<WorkItem> {
        self.pull(&CancellationToken::new()).await
    }
}
