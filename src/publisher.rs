//! At-least-once publication of event sequences to the durable bus.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prost::Message;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::events;
use crate::proto::EventSequence;

/// The durable pub-sub the rest of the system consumes. Only the narrow
/// surface the scheduler needs is modelled; the real bus client lives
/// outside this crate.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, key: &str, payload: Vec<u8>) -> Result<()>;
    fn num_partitions(&self) -> u32;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish ordered event sequences. `is_leader` is re-checked immediately
    /// before every send so a deposed scheduler cannot keep writing.
    /// Delivery is at-least-once: any error propagates and the caller rolls
    /// its cycle back, reproducing the same messages next cycle.
    async fn publish_messages(
        &self,
        sequences: Vec<EventSequence>,
        is_leader: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<()>;

    /// Emit one partition marker per bus partition so downstream consumers
    /// can detect that everything up to this point has been flushed. Returns
    /// the number of partitions marked.
    async fn publish_markers(&self, group_id: Uuid) -> Result<u32>;
}

/// Publisher writing prost-encoded sequences to an [`EventSink`], splitting
/// oversized sequences across multiple messages.
pub struct BusPublisher {
    sink: Arc<dyn EventSink>,
    max_message_bytes: usize,
}

impl BusPublisher {
    pub fn new(sink: Arc<dyn EventSink>, max_message_bytes: usize) -> Self {
        Self {
            sink,
            max_message_bytes,
        }
    }

    async fn send_sequence(
        &self,
        sequence: EventSequence,
        is_leader: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<()> {
        if sequence.events.is_empty() {
            return Ok(());
        }
        let payload = sequence.encode_to_vec();
        if payload.len() > self.max_message_bytes {
            if sequence.events.len() == 1 {
                return Err(SchedulerError::Publish(format!(
                    "single event of {} bytes exceeds the {} byte message limit",
                    payload.len(),
                    self.max_message_bytes
                )));
            }
            // Split and retry each half.
            let mid = sequence.events.len() / 2;
            let mut head = sequence.clone();
            let tail_events = head.events.split_off(mid);
            let mut tail = sequence;
            tail.events = tail_events;
            Box::pin(self.send_sequence(head, is_leader)).await?;
            return Box::pin(self.send_sequence(tail, is_leader)).await;
        }

        if !is_leader() {
            return Err(SchedulerError::NotLeader);
        }
        let key = format!("{}:{}", sequence.queue, sequence.jobset);
        self.sink.send(&key, payload).await
    }
}

#[async_trait]
impl Publisher for BusPublisher {
    async fn publish_messages(
        &self,
        sequences: Vec<EventSequence>,
        is_leader: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<()> {
        for sequence in sequences {
            self.send_sequence(sequence, is_leader).await?;
        }
        Ok(())
    }

    async fn publish_markers(&self, group_id: Uuid) -> Result<u32> {
        let group = group_id.to_string();
        let partitions = self.sink.num_partitions();
        for partition in 0..partitions {
            let sequence = EventSequence {
                queue: String::new(),
                jobset: String::new(),
                user: String::new(),
                groups: Vec::new(),
                events: vec![events::event(
                    0,
                    events::partition_marker(&group, partition),
                )],
            };
            self.sink
                .send(&format!("marker:{partition}"), sequence.encode_to_vec())
                .await?;
        }
        Ok(partitions)
    }
}

/// In-process sink retaining everything it was sent. Backs the standalone
/// mode and the tests.
pub struct InMemoryEventSink {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    num_partitions: u32,
}

impl InMemoryEventSink {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            num_partitions,
        }
    }

    /// Decode everything sent so far, in send order.
    pub fn sequences(&self) -> Vec<EventSequence> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, payload)| EventSequence::decode(payload.as_slice()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn send(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        tracing::debug!(key, bytes = payload.len(), "event sequence published");
        self.messages
            .lock()
            .unwrap()
            .push((key.to_string(), payload));
        Ok(())
    }

    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}
