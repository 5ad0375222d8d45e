//! Remote worker
//!
//! A worker pings the master until it answers, authenticates, then pulls
//! items one at a time on a single task and hands them to a pool of parse
//! tasks over a bounded channel. Each parse task reports its outcome with
//! `submit` (parsed) or `ack` (parse failure).

mod client;

pub use client::MasterClient;

use mailsift_common::config::WorkerConfig;
use mailsift_common::WorkItem;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::parser::Parser;

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Pinging,
    Authenticating,
    Working,
    Bye,
    Fatal,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

pub struct Worker {
    client: Arc<MasterClient>,
    parser: Arc<dyn Parser>,
    concurrency: usize,
    ping_interval: Duration,
    retry_interval: Duration,
    state: StdMutex<WorkerState>,
}

impl Worker {
    /// Create a worker with a fresh random identity
    pub fn new(config: &WorkerConfig, parser: Arc<dyn Parser>) -> Result<Self, WorkerError> {
        let client = MasterClient::new(
            &config.master_url,
            &config.secret,
            Uuid::new_v4(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self::with_client(Arc::new(client), parser, config))
    }

    pub fn with_client(
        client: Arc<MasterClient>,
        parser: Arc<dyn Parser>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            client,
            parser,
            concurrency: config.concurrency.max(1),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            state: StdMutex::new(WorkerState::Disconnected),
        }
    }

    pub fn id(&self) -> Uuid {
        self.client.worker_id()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != state {
            debug!(from = ?*current, to = ?state, "Worker state changed");
            *current = state;
        }
    }

    /// Run until `cancel` fires or a fatal error occurs
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(worker = %self.id(), concurrency = self.concurrency, "Worker starting");

        let (tx, rx) = mpsc::channel(self.concurrency);
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));

        let mut pool = JoinSet::new();
        for _ in 0..self.concurrency {
            pool.spawn(parse_loop(
                self.client.clone(),
                self.parser.clone(),
                rx.clone(),
                self.retry_interval,
                cancel.clone(),
            ));
        }

        let outcome = self.drive(tx, &cancel).await;

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Parse task failed");
            }
        }

        match outcome {
            Ok(()) => {
                if self.client.has_session() {
                    if let Err(e) = self.client.bye().await {
                        debug!(error = %e, "Goodbye not delivered");
                    }
                }
                self.set_state(WorkerState::Bye);
                info!(worker = %self.id(), "Worker stopped");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Fatal);
                error!(worker = %self.id(), error = %e, "Worker stopped on fatal error");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        tx: mpsc::Sender<WorkItem>,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Pinging);

        while !cancel.is_cancelled() {
            match self.state() {
                WorkerState::Disconnected | WorkerState::Pinging => {
                    if self.wait_for_master(cancel).await {
                        self.set_state(WorkerState::Authenticating);
                    }
                }
                WorkerState::Authenticating => {
                    let result = tokio::select! {
                        result = self.client.authenticate() => result,
                        _ = cancel.cancelled() => break,
                    };
                    match result {
                        Ok(()) => self.set_state(WorkerState::Working),
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Master unreachable during handshake");
                            self.set_state(WorkerState::Pinging);
                        }
                        Err(e) => return Err(e),
                    }
                }
                WorkerState::Working => {
                    let result = tokio::select! {
                        result = self.client.work() => result,
                        _ = cancel.cancelled() => break,
                    };
                    match result {
                        Ok(Some(item)) => {
                            debug!(id = %item.id, "Received work item");
                            tokio::select! {
                                sent = tx.send(item) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                                _ = cancel.cancelled() => break,
                            }
                        }
                        Ok(None) => self.pause(cancel).await,
                        Err(WorkerError::Unauthorized) => {
                            warn!("Session rejected by master, re-authenticating");
                            self.set_state(WorkerState::Authenticating);
                        }
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Lost connection to master");
                            self.set_state(WorkerState::Pinging);
                        }
                        Err(e) => {
                            warn!(error = %e, "Work request failed");
                            self.pause(cancel).await;
                        }
                    }
                }
                WorkerState::Bye | WorkerState::Fatal => break,
            }
        }
        Ok(())
    }

    /// Ping until the master answers. Returns false when cancelled.
    async fn wait_for_master(&self, cancel: &CancellationToken) -> bool {
        loop {
            let result = tokio::select! {
                result = self.client.status() => result,
                _ = cancel.cancelled() => return false,
            };
            match result {
                Ok(()) => return true,
                Err(e) => debug!(error = %e, "Master not reachable yet"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ping_interval) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_interval) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

async fn parse_loop(
    client: Arc<MasterClient>,
    parser: Arc<dyn Parser>,
    rx: SharedReceiver,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let item = rx.lock().await.recv().await;
        let Some(item) = item else {
            break;
        };
        let id = item.id;

        match parser.parse(&item).await {
            Ok(mut record) => {
                record.worker = Some(client.worker_id());
                report("submit", retry_interval, &cancel, || client.submit(&record)).await;
            }
            Err(e) => {
                warn!(%id, error = %e, "Parse failed, releasing item");
                report("ack", retry_interval, &cancel, || client.ack(id)).await;
            }
        }
    }
}

/// Deliver a report, retrying transient transport errors
async fn report<F, Fut>(call: &str, retry_interval: Duration, cancel: &CancellationToken, mut op: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), WorkerError>>,
{
    loop {
        let result = tokio::select! {
            result = op() => result,
            _ = cancel.cancelled() => {
                debug!(call, "Report abandoned on shutdown");
                return;
            }
        };
        match result {
            Ok(()) => return,
            Err(e) if e.is_transient() => {
                debug!(call, error = %e, "Transient error, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(call, error = %e, "Report abandoned");
                return;
            }
        }
    }
}
