//! In-process queue backend
//!
//! A bounded buffer for deployments where ingestion and parsing share one
//! process. Capacity 0 turns the buffer into a rendezvous: a push only
//! completes once a puller is waiting for the item. Items that a consumer
//! drops after pulling are not redelivered.

use async_trait::async_trait;
use mailsift_common::{WorkItem, WorkItemId};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::queue::WorkQueue;

#[derive(Default)]
struct State {
    items: VecDeque<WorkItem>,
    waiting_pullers: usize,
    closed: bool,
}

/// Bounded in-memory work queue
pub struct MemoryQueue {
    capacity: usize,
    state: Mutex<State>,
    not_empty: Notify,
    not_full: Notify,
}

impl MemoryQueue {
    /// Create a queue holding at most `capacity` items (0 = rendezvous)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Critical sections never panic; recover the guard if one somehow did.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps the waiting-puller count honest even if a pull future is dropped.
struct WaitingPuller<'a> {
    queue: &'a MemoryQueue,
}

impl<'a> WaitingPuller<'a> {
    fn register(queue: &'a MemoryQueue) -> Self {
        queue.state().waiting_pullers += 1;
        // A rendezvous pusher may be waiting for exactly this.
        queue.not_full.notify_waiters();
        Self { queue }
    }
}

impl Drop for WaitingPuller<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state();
        state.waiting_pullers = state.waiting_pullers.saturating_sub(1);
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> QueueResult<()> {
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if cancel.is_cancelled() {
                    return Err(QueueError::Cancelled);
                }
                let limit = self.capacity.max(state.waiting_pullers);
                if state.items.len() < limit {
                    if let Some(item) = item.take() {
                        debug!(id = %item.id, "Queued item in memory");
                        state.items.push_back(item);
                    }
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    async fn pull(&self, cancel: &CancellationToken) -> QueueResult<WorkItem> {
        let _waiting = WaitingPuller::register(self);
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if state.closed {
                    return Err(QueueError::Closed);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    async fn acknowledge(&self, _id: WorkItemId) {}

    async fn close(&self) {
        self.state().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
