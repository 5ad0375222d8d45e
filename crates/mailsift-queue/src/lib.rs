//! MailSift Queue - Durable work queue backends
//!
//! Every backend implements [`WorkQueue`] with at-least-once delivery.
//! Backends without native redelivery are wrapped in [`Redelivering`].

pub mod amqp_queue;
pub mod breaker;
pub mod disk;
pub mod error;
pub mod memory;
pub mod queue;
pub mod redelivery;
pub mod redis_queue;

pub use amqp_queue::AmqpQueue;
pub use disk::DiskQueue;
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use queue::{SharedQueue, WorkQueue};
pub use redelivery::{Redelivering, RedeliveryTracker};
pub use redis_queue::RedisQueue;

use mailsift_common::config::{QueueBackend, QueueConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build the configured backend.
///
/// Disk and Redis backends get a redelivery sweeper when redelivery is
/// enabled; it stops when `cancel` fires.
pub async fn create_queue(
    config: &QueueConfig,
    cancel: &CancellationToken,
) -> QueueResult<SharedQueue> {
    let queue: SharedQueue = match config.backend {
        QueueBackend::Memory => return Ok(Arc::new(MemoryQueue::new(config.memory.capacity))),
        QueueBackend::Amqp => return Ok(Arc::new(AmqpQueue::new(&config.amqp).await?)),
        QueueBackend::Disk => Arc::new(DiskQueue::new(&config.disk)?),
        QueueBackend::Redis => Arc::new(RedisQueue::new(&config.redis).await?),
    };

    let redelivery = &config.redelivery;
    if !redelivery.enabled {
        return Ok(queue);
    }

    let wrapped = Arc::new(Redelivering::from_config(queue, redelivery));
    wrapped.spawn_sweeper(
        Duration::from_secs(redelivery.sweep_interval_secs.max(1)),
        cancel.clone(),
    );
    info!(
        backend = %config.backend,
        timeout_secs = redelivery.timeout_secs,
        aging = ?redelivery.aging,
        "Redelivery enabled"
    );
    Ok(wrapped)
}
