//! AMQP broker-backed queue
//!
//! Items are published as persistent messages to a durable queue. The
//! broker owns redelivery: deliveries stay unacknowledged until
//! [`WorkQueue::acknowledge`] is called with the item id, and the broker
//! requeues them if the consumer goes away first.
//!
//! The connection, channel and consumer form one [`Link`]. When the broker
//! drops the connection or closes the channel, the link is rebuilt and
//! ackers taken on the old channel are discarded.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use mailsift_common::config::AmqpQueueConfig;
use mailsift_common::{WorkItem, WorkItemId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::{Backoff, CircuitBreaker, RetryPolicy};
use crate::error::{QueueError, QueueResult};
use crate::queue::WorkQueue;

const CONSUMER_TAG: &str = "mailsift-master";

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// Whether a broker error means the connection or channel is gone
fn is_link_failure(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannel(_)
            | lapin::Error::IOError(_)
            | lapin::Error::ProtocolError(_)
            | lapin::Error::MissingHeartbeatError
    )
}

/// One connection with its channel and consumer
struct Link {
    connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
    generation: u64,
}

impl Link {
    async fn open(config: &AmqpQueueConfig, generation: u64) -> QueueResult<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                &config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            connection,
            channel,
            consumer: Mutex::new(consumer),
            generation,
        })
    }

    fn is_alive(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn publish(
        &self,
        queue: &str,
        id: &WorkItemId,
        payload: &[u8],
    ) -> Result<Confirmation, lapin::Error> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_message_id(ShortString::from(id.to_string()));

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await?
            .await
    }

    async fn shutdown(&self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            debug!(error = %e, "Failed to close AMQP channel");
        }
        if let Err(e) = self.connection.close(200, "closing").await {
            debug!(error = %e, "Failed to close AMQP connection");
        }
    }
}

/// Broker acker for a pulled item, tied to the link it came from
struct PendingAck {
    acker: Acker,
    generation: u64,
}

/// AMQP work queue
pub struct AmqpQueue {
    config: AmqpQueueConfig,
    link: RwLock<Arc<Link>>,
    /// Serializes link rebuilds
    reconnecting: Mutex<()>,
    /// Broker ackers for pulled, not yet acknowledged items
    pending: DashMap<WorkItemId, PendingAck>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    closed: AtomicBool,
}

impl AmqpQueue {
    /// Connect, declare the durable queue and start consuming
    pub async fn new(config: &AmqpQueueConfig) -> QueueResult<Self> {
        let link = Link::open(config, 0).await?;
        info!(queue = %config.queue, "Connected AMQP queue");

        Ok(Self {
            config: config.clone(),
            link: RwLock::new(Arc::new(link)),
            reconnecting: Mutex::new(()),
            pending: DashMap::new(),
            retry: RetryPolicy::new(
                config.publish_attempts,
                Duration::from_secs(config.publish_retry_secs),
            ),
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_reset_secs),
            ),
            closed: AtomicBool::new(false),
        })
    }

    async fn current(&self) -> Arc<Link> {
        self.link.read().await.clone()
    }

    /// Replace `failed` with a fresh link, once.
    ///
    /// Returns the current link if another caller already replaced it.
    async fn try_reconnect(&self, failed: &Arc<Link>) -> QueueResult<Arc<Link>> {
        let _guard = self.reconnecting.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let current = self.current().await;
        if current.generation != failed.generation {
            return Ok(current);
        }

        let link = Arc::new(Link::open(&self.config, failed.generation + 1).await?);
        *self.link.write().await = link.clone();

        let before = self.pending.len();
        self.pending
            .retain(|_, pending| pending.generation >= link.generation);
        let dropped = before.saturating_sub(self.pending.len());
        failed.shutdown().await;
        info!(
            generation = link.generation,
            dropped_ackers = dropped,
            "Reconnected AMQP queue"
        );
        Ok(link)
    }

    /// Rebuild the link, backing off between attempts until it succeeds,
    /// the queue is closed, or `cancel` fires
    async fn reconnect(
        &self,
        failed: &Arc<Link>,
        cancel: &CancellationToken,
    ) -> QueueResult<Arc<Link>> {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.reconnect_initial_secs.max(1)),
            Duration::from_secs(self.config.reconnect_max_secs.max(1)),
        );
        loop {
            match self.try_reconnect(failed).await {
                Ok(link) => return Ok(link),
                Err(QueueError::Closed) => return Err(QueueError::Closed),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "AMQP reconnect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                    }
                }
            }
        }
    }

    async fn publish_once(&self, id: &WorkItemId, payload: &[u8]) -> QueueResult<()> {
        let link = self.current().await;
        match link.publish(&self.config.queue, id, payload).await {
            Ok(confirmation) if confirmation.is_nack() => Err(QueueError::Broker(format!(
                "broker refused message {}",
                id
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                if is_link_failure(&e) || !link.is_alive() {
                    // The retry policy spaces out further attempts.
                    if let Err(reconnect) = self.try_reconnect(&link).await {
                        debug!(error = %reconnect, "AMQP reconnect before republish failed");
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Take one delivery from `link`; `Ok(None)` when the link is gone
    async fn receive(
        &self,
        link: &Link,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<WorkItem>> {
        let mut consumer = tokio::select! {
            consumer = link.consumer.lock() => consumer,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };

        loop {
            let delivery = tokio::select! {
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) if is_link_failure(&e) => {
                        warn!(error = %e, "AMQP consumer lost its channel");
                        return Ok(None);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None if self.closed.load(Ordering::Acquire) => return Err(QueueError::Closed),
                    None => {
                        warn!("AMQP consumer stream ended");
                        return Ok(None);
                    }
                },
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            };

            let item = match WorkItem::decode(&delivery.data) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Rejecting undecodable delivery");
                    if let Err(e) = delivery
                        .acker
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                    {
                        warn!(error = %e, "Failed to reject delivery");
                    }
                    continue;
                }
            };

            if cancel.is_cancelled() {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await?;
                return Err(QueueError::Cancelled);
            }

            self.pending.insert(
                item.id,
                PendingAck {
                    acker: delivery.acker,
                    generation: link.generation,
                },
            );
            debug!(id = %item.id, "Received item from broker");
            return Ok(Some(item));
        }
    }

    /// Number of pulled items awaiting acknowledgement
    pub fn unacknowledged(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl WorkQueue for AmqpQueue {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        if !self.breaker.allow() {
            return Err(QueueError::CircuitOpen);
        }

        let payload = item.encode()?;
        let result = self
            .retry
            .run(cancel, || self.publish_once(&item.id, &payload))
            .await;

        match &result {
            Ok(()) => {
                self.breaker.record_success();
                debug!(id = %item.id, "Published item to broker");
            }
            Err(QueueError::Cancelled) => {}
            Err(e) => {
                self.breaker.record_failure();
                error!(id = %item.id, error = %e, "Giving up publishing item");
            }
        }
        result
    }

    async fn pull(&self, cancel: &CancellationToken) -> QueueResult<WorkItem> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            let link = self.current().await;
            match self.receive(&link, cancel).await? {
                Some(item) => return Ok(item),
                None => {
                    self.reconnect(&link, cancel).await?;
                }
            }
        }
    }

    async fn acknowledge(&self, id: WorkItemId) {
        let Some((_, pending)) = self.pending.remove(&id) else {
            return;
        };
        if pending.generation != self.current().await.generation {
            debug!(%id, "Dropping acknowledgement for a delivery from a closed channel");
            return;
        }
        if let Err(e) = pending.acker.ack(BasicAckOptions::default()).await {
            warn!(%id, error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.reconnecting.lock().await;
        self.current().await.shutdown().await;
        info!("Closed AMQP queue");
    }
}
