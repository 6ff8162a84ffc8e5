// =============================================================================
// In-process partitioned bus
// =============================================================================
//
// Each topic holds `partitions` append-only logs. Consumers belong to a
// group; committed positions are stored per (group, topic, partition) so a
// new consumer of the same group resumes where the previous one committed.
//
// Thread safety:
//   - parking_lot::Mutex per partition log, RwLock for the topic table.
//   - A watch channel carries a publish sequence number used to wake
//     consumers that are waiting on empty partitions.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{partition_for, BusError, BusMessage, Consumer, Producer};

struct PartitionLog {
    /// Offset of `messages[0]`.
    base_offset: u64,
    messages: VecDeque<BusMessage>,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            base_offset: 0,
            messages: VecDeque::new(),
        }
    }

    fn next_offset(&self) -> u64 {
        self.base_offset + self.messages.len() as u64
    }
}

struct Topic {
    partitions: Vec<Mutex<PartitionLog>>,
}

type OffsetKey = (String, String, usize);

struct Inner {
    partitions: usize,
    retention: usize,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    committed: Mutex<HashMap<OffsetKey, u64>>,
    closed: AtomicBool,
    sequence: watch::Sender<u64>,
}

impl Inner {
    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(t) = self.topics.read().get(name) {
            return t.clone();
        }
        self.topics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = name, partitions = self.partitions, "topic created");
                Arc::new(Topic {
                    partitions: (0..self.partitions)
                        .map(|_| Mutex::new(PartitionLog::new()))
                        .collect(),
                })
            })
            .clone()
    }
}

/// Handle to an in-process bus. Cloning yields another handle to the same
/// bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Create a bus whose topics have `partitions` partitions and keep at
    /// most `retention` messages per partition.
    pub fn new(partitions: usize, retention: usize) -> Self {
        let (sequence, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                retention: retention.max(1),
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                sequence,
            }),
        }
    }

    pub fn producer(&self) -> Result<MemoryProducer, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(MemoryProducer {
            inner: self.inner.clone(),
        })
    }

    /// Subscribe `group` to `topic`, starting at the group's committed
    /// positions (or the earliest retained message).
    pub fn consumer(&self, group: &str, topic: &str) -> Result<MemoryConsumer, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let t = self.inner.topic(topic);
        let committed = self.inner.committed.lock();
        let positions = (0..t.partitions.len())
            .map(|p| {
                committed
                    .get(&(group.to_string(), topic.to_string(), p))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        drop(committed);

        let member_id = Uuid::new_v4();
        info!(group, topic, member = %member_id, "consumer joined");
        Ok(MemoryConsumer {
            inner: self.inner.clone(),
            topic: t,
            topic_name: topic.to_string(),
            group: group.to_string(),
            member_id,
            positions,
            next_partition: 0,
            wake: self.inner.sequence.subscribe(),
        })
    }

    /// Stop accepting publishes and wake every waiting consumer. Consumers
    /// still drain what was already published.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("message bus closed");
            self.inner.sequence.send_modify(|s| *s = s.wrapping_add(1));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Messages currently retained in `topic`, over all partitions.
    pub fn retained(&self, topic: &str) -> usize {
        self.inner
            .topic(topic)
            .partitions
            .iter()
            .map(|p| p.lock().messages.len())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryProducer {
    inner: Arc<Inner>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let t = self.inner.topic(topic);
        let partition = partition_for(key, t.partitions.len());
        {
            let mut log = t.partitions[partition].lock();
            let offset = log.next_offset();
            log.messages.push_back(BusMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
                partition,
                offset,
            });
            while log.messages.len() > self.inner.retention {
                log.messages.pop_front();
                log.base_offset += 1;
            }
        }
        self.inner.sequence.send_modify(|s| *s = s.wrapping_add(1));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct MemoryConsumer {
    inner: Arc<Inner>,
    topic: Arc<Topic>,
    topic_name: String,
    group: String,
    member_id: Uuid,
    /// Next offset to read, per partition.
    positions: Vec<u64>,
    next_partition: usize,
    wake: watch::Receiver<u64>,
}

impl MemoryConsumer {
    /// Take the next message from any partition, rotating the starting
    /// partition so one busy pair cannot starve the others.
    fn try_next(&mut self) -> Option<BusMessage> {
        let n = self.positions.len();
        for i in 0..n {
            let p = (self.next_partition + i) % n;
            let log = self.topic.partitions[p].lock();
            if self.positions[p] < log.base_offset {
                warn!(
                    topic = %self.topic_name,
                    partition = p,
                    skipped = log.base_offset - self.positions[p],
                    "consumer fell behind retention, skipping discarded messages"
                );
                self.positions[p] = log.base_offset;
            }
            let idx = (self.positions[p] - log.base_offset) as usize;
            if let Some(msg) = log.messages.get(idx) {
                self.positions[p] += 1;
                self.next_partition = (p + 1) % n;
                return Some(msg.clone());
            }
        }
        None
    }

    pub fn member_id(&self) -> Uuid {
        self.member_id
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<Option<BusMessage>, BusError> {
        loop {
            // Mark the current sequence as seen before scanning, so a publish
            // racing with the scan still wakes `changed()` below.
            self.wake.borrow_and_update();
            if let Some(msg) = self.try_next() {
                return Ok(Some(msg));
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if self.wake.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    fn commit(&mut self) -> Result<(), BusError> {
        let mut committed = self.inner.committed.lock();
        for (p, pos) in self.positions.iter().enumerate() {
            committed.insert((self.group.clone(), self.topic_name.clone(), p), *pos);
        }
        debug!(group = %self.group, topic = %self.topic_name, member = %self.member_id, "offsets committed");
        Ok(())
    }
}
