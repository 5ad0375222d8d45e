//! Redis-backed queue
//!
//! Items are gzip-compressed MessagePack records appended to a Redis list
//! with RPUSH and taken with BLPOP, which makes this the only backend with
//! FIFO ordering. Records that fail to decode are moved to a `:corrupt`
//! list instead of being dropped.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use mailsift_common::config::RedisQueueConfig;
use mailsift_common::{WorkItem, WorkItemId};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::WorkQueue;

/// Redis list work queue
pub struct RedisQueue {
    key: String,
    corrupt_key: String,
    poll_timeout: f64,
    push_conn: MultiplexedConnection,
    /// BLPOP stalls a connection, so pulls get their own
    pull_conn: Mutex<MultiplexedConnection>,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Connect to Redis
    pub async fn new(config: &RedisQueueConfig) -> QueueResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let push_conn = client.get_multiplexed_async_connection().await?;
        let pull_conn = client.get_multiplexed_async_connection().await?;

        info!(key = %config.key, "Connected Redis queue");

        Ok(Self {
            key: config.key.clone(),
            corrupt_key: format!("{}:corrupt", config.key),
            poll_timeout: config.poll_timeout_secs.max(0.1),
            push_conn,
            pull_conn: Mutex::new(pull_conn),
            closed: AtomicBool::new(false),
        })
    }

    async fn rpush(&self, key: &str, payload: &[u8]) -> QueueResult<()> {
        let mut conn = self.push_conn.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Number of queued items
    pub async fn len(&self) -> QueueResult<usize> {
        let mut conn = self.push_conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

/// Serialize and compress an item for storage
pub fn encode_payload(item: &WorkItem) -> QueueResult<Vec<u8>> {
    let bytes = item.encode()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress and deserialize a stored item
pub fn decode_payload(payload: &[u8]) -> QueueResult<WorkItem> {
    let mut bytes = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut bytes)
        .map_err(|e| QueueError::Serialization(format!("gzip: {}", e)))?;
    Ok(WorkItem::decode(&bytes)?)
}

#[async_trait]
impl WorkQueue for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let payload = encode_payload(&item)?;
        self.rpush(&self.key, &payload).await?;
        debug!(id = %item.id, "Pushed item to Redis");
        Ok(())
    }

    async fn pull(&self, cancel: &CancellationToken) -> QueueResult<WorkItem> {
        let mut conn = tokio::select! {
            conn = self.pull_conn.lock() => conn,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
                .arg(&self.key)
                .arg(self.poll_timeout)
                .query_async(&mut *conn)
                .await?;

            let Some((_, payload)) = popped else {
                continue;
            };

            if cancel.is_cancelled() {
                // Lands at the tail; FIFO position is not preserved.
                self.rpush(&self.key, &payload).await?;
                return Err(QueueError::Cancelled);
            }

            match decode_payload(&payload) {
                Ok(item) => {
                    debug!(id = %item.id, "Pulled item from Redis");
                    return Ok(item);
                }
                Err(e) => {
                    warn!(error = %e, "Moving undecodable record to {}", self.corrupt_key);
                    self.rpush(&self.corrupt_key, &payload).await?;
                }
            }
        }
    }

    async fn acknowledge(&self, _id: WorkItemId) {}

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
