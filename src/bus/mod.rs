// =============================================================================
// Message Bus: producer/consumer seam between the two services
// =============================================================================
//
// Topics are split into partitions; the partition of a message is a pure
// function of its key, so every message for one trading pair is delivered
// to a consumer in the order it was published.
// =============================================================================

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::ExponentialBackoff;

pub use memory::{MemoryBus, MemoryConsumer, MemoryProducer};

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: usize,
    pub offset: u64,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,
    #[error("failed to serialise message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },
}

impl BusError {
    /// Whether repeating the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Next message of the subscribed topic. Waits while the topic is empty;
    /// returns `None` once the bus is closed and drained.
    async fn poll(&mut self) -> Result<Option<BusMessage>, BusError>;

    /// Record the position of every message returned so far for this
    /// consumer's group.
    fn commit(&mut self) -> Result<(), BusError>;
}

/// Partition for `key`. FNV-1a so the mapping is stable across processes.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % partitions.max(1) as u64) as usize
}

/// Serialise `value` as JSON and publish it, retrying transient rejections
/// per `policy`. Returns the number of retries that were needed.
pub async fn publish_json<T>(
    producer: &dyn Producer,
    topic: &str,
    key: &str,
    value: &T,
    mut policy: ExponentialBackoff,
) -> Result<u32, BusError>
where
    T: Serialize + ?Sized + Sync,
{
    let payload = serde_json::to_vec(value)?;
    policy.reset();
    loop {
        match producer.publish(topic, key, payload.clone()).await {
            Ok(()) => {
                debug!(topic, key, retries = policy.attempts(), "published");
                return Ok(policy.attempts());
            }
            Err(e) if e.is_retryable() => match policy.next_delay() {
                Some(delay) => {
                    warn!(
                        topic,
                        key,
                        attempt = policy.attempts(),
                        error = %e,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
