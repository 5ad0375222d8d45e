//! Master state: handshakes, sessions and the shared queue

use dashmap::DashMap;
use mailsift_common::config::MasterConfig;
use mailsift_common::{SessionKey, WorkItem, WorkItemId, WorkerId};
use mailsift_core::{pake, ResultSink};
use mailsift_queue::{QueueError, SharedQueue};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::metrics::MasterMetrics;

/// Handshake between `init` and `auth`
struct PendingHandshake {
    key: SessionKey,
    created: Instant,
}

/// Submitted uids remembered per session
const SUBMITTED_WINDOW: usize = 1024;

/// Most recent submissions, oldest first
#[derive(Default)]
struct SubmittedWindow {
    order: VecDeque<WorkItemId>,
    seen: HashSet<WorkItemId>,
}

impl SubmittedWindow {
    /// Remember `id`; false if it is already in the window
    fn insert(&mut self, id: WorkItemId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SUBMITTED_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Authenticated worker session
pub struct Session {
    key: SessionKey,
    /// Last accepted request id
    counter: Mutex<u64>,
    submitted: std::sync::Mutex<SubmittedWindow>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            counter: Mutex::new(0),
            submitted: std::sync::Mutex::new(SubmittedWindow::default()),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Record a result submission; false if this session already sent it
    pub fn first_submission(&self, id: WorkItemId) -> bool {
        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id)
    }
}

/// State shared by every master request handler
pub struct MasterState {
    secret: String,
    pub queue: SharedQueue,
    pub sink: Arc<dyn ResultSink>,
    pub metrics: MasterMetrics,
    pending: DashMap<WorkerId, PendingHandshake>,
    sessions: DashMap<WorkerId, Arc<Session>>,
    handshake_ttl: Duration,
    work_wait: Duration,
}

impl MasterState {
    pub fn new(
        config: &MasterConfig,
        queue: SharedQueue,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, prometheus::Error> {
        Ok(Self {
            secret: config.secret.clone(),
            queue,
            sink,
            metrics: MasterMetrics::new()?,
            pending: DashMap::new(),
            sessions: DashMap::new(),
            handshake_ttl: config.handshake_ttl(),
            work_wait: config.work_wait(),
        })
    }

    /// Count a rejected request and build its error
    pub fn reject(&self, worker: &WorkerId, reason: &'static str) -> ApiError {
        warn!(%worker, reason, "Rejected worker request");
        self.metrics.inc_protocol_failure(reason);
        ApiError::Unauthorized(reason)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn update_session_gauge(&self) {
        self.metrics.active_sessions.set(self.sessions.len() as i64);
    }

    /// Answer a worker's SPAKE2 message and remember the candidate key
    pub fn begin_handshake(&self, worker: WorkerId, message: &[u8]) -> Result<Vec<u8>, ApiError> {
        let (key, reply) = pake::respond(&self.secret, message).map_err(|e| {
            debug!(%worker, error = %e, "Bad handshake message");
            self.reject(&worker, "malformed_handshake")
        })?;

        self.pending.insert(
            worker,
            PendingHandshake {
                key,
                created: Instant::now(),
            },
        );
        debug!(%worker, "Handshake started");
        Ok(reply)
    }

    /// Verify the worker's key confirmation and install its session
    pub fn complete_handshake(&self, worker: WorkerId, tag: &[u8]) -> Result<(), ApiError> {
        let Some((_, pending)) = self.pending.remove(&worker) else {
            return Err(self.reject(&worker, "no_handshake"));
        };
        if pending.created.elapsed() > self.handshake_ttl {
            return Err(self.reject(&worker, "handshake_expired"));
        }
        if !pake::verify_confirmation(&pending.key, &worker, tag) {
            return Err(self.reject(&worker, "bad_confirmation"));
        }

        self.sessions
            .insert(worker, Arc::new(Session::new(pending.key)));
        self.update_session_gauge();
        info!(%worker, "Worker authenticated");
        Ok(())
    }

    /// Drop a session, unless it was already replaced by a newer one
    fn destroy_session(&self, worker: &WorkerId, session: &Arc<Session>) {
        if self
            .sessions
            .remove_if(worker, |_, current| Arc::ptr_eq(current, session))
            .is_some()
        {
            self.update_session_gauge();
        }
    }

    /// Decrypt a request body under the worker's session key.
    ///
    /// A body that fails to decrypt destroys the session.
    pub fn open(&self, worker: &WorkerId, body: &[u8]) -> Result<(Arc<Session>, Vec<u8>), ApiError> {
        let session = self
            .sessions
            .get(worker)
            .map(|s| s.value().clone())
            .ok_or_else(|| self.reject(worker, "no_session"))?;

        match session.key.decrypt(body) {
            Ok(plain) => Ok((session, plain)),
            Err(e) => {
                debug!(%worker, error = %e, "Undecryptable request");
                self.destroy_session(worker, &session);
                Err(self.reject(worker, "decrypt"))
            }
        }
    }

    /// Accept `request_id` only if it is exactly one past the last one.
    ///
    /// Any other value destroys the session.
    pub async fn check_sequence(
        &self,
        worker: &WorkerId,
        session: &Arc<Session>,
        request_id: u64,
    ) -> Result<(), ApiError> {
        let mut counter = session.counter.lock().await;
        if request_id == counter.wrapping_add(1) {
            *counter = request_id;
            return Ok(());
        }
        let expected = counter.wrapping_add(1);
        drop(counter);

        warn!(%worker, request_id, expected, "Out-of-sequence request, dropping session");
        self.destroy_session(worker, session);
        Err(self.reject(worker, "sequence"))
    }

    pub fn end_session(&self, worker: &WorkerId, session: &Arc<Session>) {
        self.destroy_session(worker, session);
        info!(%worker, "Worker said goodbye");
    }

    /// Pull one item for a `work` request.
    ///
    /// The pull runs on its own task and is cancelled when the wait expires
    /// or the request future is dropped. An item that arrives for a
    /// cancelled request goes back to the queue.
    pub async fn pull_for(&self, worker: &WorkerId) -> Result<WorkItem, ApiError> {
        let cancel = CancellationToken::new();
        let abandon = cancel.clone().drop_guard();

        let queue = self.queue.clone();
        let pull_cancel = cancel.clone();
        let mut task = tokio::spawn(async move {
            let item = queue.pull(&pull_cancel).await?;
            if pull_cancel.is_cancelled() {
                let id = item.id;
                queue.acknowledge(id).await;
                if let Err(e) = queue.push_now(item).await {
                    error!(%id, error = %e, "Failed to return item from abandoned request");
                } else {
                    debug!(%id, "Returned item from abandoned request");
                }
                return Err(QueueError::Cancelled);
            }
            Ok(item)
        });

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = tokio::time::sleep(self.work_wait) => {
                cancel.cancel();
                task.await
            }
        };
        let _ = abandon.disarm();

        match joined {
            Ok(Ok(item)) => {
                self.metrics.items_pulled.inc();
                debug!(%worker, id = %item.id, "Handing out work item");
                Ok(item)
            }
            Ok(Err(QueueError::Cancelled)) | Ok(Err(QueueError::Closed)) => Err(ApiError::NoWork),
            Ok(Err(e)) => {
                error!(%worker, error = %e, "Queue pull failed");
                Err(ApiError::Internal(e.to_string()))
            }
            Err(e) => Err(ApiError::Internal(format!("pull task failed: {}", e))),
        }
    }

    /// Discard handshakes older than the TTL. Returns how many were removed.
    pub fn expire_handshakes(&self) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| pending.created.elapsed() <= self.handshake_ttl);
        before.saturating_sub(self.pending.len())
    }

    pub fn spawn_handshake_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = self.handshake_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = this.expire_handshakes();
                        if expired > 0 {
                            debug!(expired, "Discarded abandoned handshakes");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_submitted_window_drops_oldest() {
        let mut window = SubmittedWindow::default();
        let first = Uuid::now_v7();
        assert!(window.insert(first));
        assert!(!window.insert(first));

        for _ in 0..SUBMITTED_WINDOW {
            assert!(window.insert(Uuid::now_v7()));
        }
        assert_eq!(window.order.len(), SUBMITTED_WINDOW);
        // Evicted, so accepted again.
        assert!(window.insert(first));
    }
}
