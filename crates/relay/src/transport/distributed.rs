//! Multi-process transport over a partitioned log.
//!
//! Readers append straight to the chat topic; the log itself is the
//! backpressure boundary. Each process consumes its assigned partitions
//! and only ever forwards to its own connections.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{InboundRecord, PresenceStream, RecordOrigin, RecordStream, Transport};
use crate::config::{RelayConfig, TopicConfig};
use crate::connection::Connection;
use crate::error::Result;
use crate::hub::admission::Admission;
use crate::log::{LogBroker, LogRecord, StartOffset};
use crate::models::{PresenceEvent, PresenceKind};

pub struct DistributedQueue {
    broker: Arc<dyn LogBroker>,
    topics: TopicConfig,
    /// Partition key for every record this process publishes
    shard_key: String,
    assigned: Vec<u32>,
    start: StartOffset,
}

impl DistributedQueue {
    /// Consumes `config.assigned_partitions` of the chat topic, or just the
    /// shard's own partition when none are configured. With more than one
    /// partition, spread them across processes so every one is consumed.
    pub fn new(broker: Arc<dyn LogBroker>, config: &RelayConfig) -> Self {
        let shard_key = config.shard.to_string();
        let assigned = if config.assigned_partitions.is_empty() {
            vec![broker.partition_for(shard_key.as_bytes())]
        } else {
            config.assigned_partitions.clone()
        };
        let start = if config.log_from_start {
            StartOffset::Earliest
        } else {
            StartOffset::Latest
        };
        Self {
            broker,
            topics: config.topics.clone(),
            shard_key,
            assigned,
            start,
        }
    }

    pub fn assigned_partitions(&self) -> &[u32] {
        &self.assigned
    }

    async fn presence_topic(&self, topic: &str) -> Result<Vec<PresenceStream>> {
        let mut streams = Vec::new();
        for partition in 0..self.broker.partitions() {
            let records = self.broker.consume(topic, partition, self.start).await?;
            let events = records
                .filter_map(|record| async move {
                    let record = match record {
                        Ok(record) => record,
                        Err(e) => {
                            warn!("[Transport] unreadable presence record: {}", e);
                            return None;
                        }
                    };
                    match serde_json::from_slice::<PresenceEvent>(&record.payload) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(
                                "[Transport] bad presence record {}/{}@{}: {}",
                                record.topic, record.partition, record.offset, e
                            );
                            None
                        }
                    }
                })
                .boxed();
            streams.push(events);
        }
        Ok(streams)
    }
}

/// Every process consuming a partition derives the same envelope id for a
/// record, so duplicate routing collapses onto one stored message.
fn envelope_id_for(record: &LogRecord) -> String {
    format!(
        "M{:x}p{}o{}",
        record.timestamp.timestamp_micros(),
        record.partition,
        record.offset
    )
}

#[async_trait]
impl Transport for DistributedQueue {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn submit(&self, conn: &Connection, raw: String) -> Result<Admission<String>> {
        let position = self
            .broker
            .append(&self.topics.chat, self.shard_key.as_bytes(), Bytes::from(raw))
            .await?;
        debug!(
            "[Transport] {} appended at {}@{}",
            conn.client_id(),
            position.partition,
            position.offset
        );
        Ok(Admission::Direct)
    }

    async fn subscribe(&self) -> Result<Vec<RecordStream>> {
        let mut streams = Vec::with_capacity(self.assigned.len());
        for &partition in &self.assigned {
            let records = self
                .broker
                .consume(&self.topics.chat, partition, self.start)
                .await?;
            let inbound = records
                .filter_map(|record| async move {
                    let record = match record {
                        Ok(record) => record,
                        Err(e) => {
                            warn!("[Transport] unreadable chat record: {}", e);
                            return None;
                        }
                    };
                    let origin = RecordOrigin::Log {
                        partition: record.partition,
                        offset: record.offset,
                    };
                    match String::from_utf8(record.payload.to_vec()) {
                        Ok(payload) => Some(InboundRecord {
                            payload,
                            origin,
                            envelope_id: Some(envelope_id_for(&record)),
                        }),
                        Err(e) => {
                            warn!("[Transport] non-UTF-8 chat record at {}: {}", origin, e);
                            None
                        }
                    }
                })
                .boxed();
            streams.push(inbound);
        }
        Ok(streams)
    }

    async fn announce(&self, event: PresenceEvent) -> Result<()> {
        let topic = match event.kind {
            PresenceKind::Login => &self.topics.login,
            PresenceKind::Logout => &self.topics.logout,
        };
        let payload = serde_json::to_vec(&event)?;
        self.broker
            .append(topic, self.shard_key.as_bytes(), Bytes::from(payload))
            .await?;
        Ok(())
    }

    async fn presence(&self) -> Result<Option<PresenceStream>> {
        let mut streams = self.presence_topic(&self.topics.login).await?;
        streams.extend(self.presence_topic(&self.topics.logout).await?);
        Ok(Some(stream::select_all(streams).boxed()))
    }

    async fn close(&self) -> Result<()> {
        self.broker.close().await
    }
}
