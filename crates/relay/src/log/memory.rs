//! In-process partitioned log

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};

use super::{LogBroker, LogPosition, LogRecord, LogStream, StartOffset};
use crate::error::{RelayError, Result};

#[derive(Default)]
struct Partition {
    records: RwLock<Vec<LogRecord>>,
    appended: Notify,
}

impl Partition {
    fn read_from(&self, offset: u64) -> Vec<LogRecord> {
        let records = self.records.read();
        let start = (offset as usize).min(records.len());
        records[start..].to_vec()
    }

    fn len(&self) -> u64 {
        self.records.read().len() as u64
    }
}

/// Log kept entirely in memory. Shared between hubs in one process it
/// stands in for a broker in tests and single-node runs.
pub struct MemoryLog {
    partitions: u32,
    topics: RwLock<HashMap<(String, u32), Arc<Partition>>>,
    closed: watch::Sender<bool>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            partitions: partitions.max(1),
            topics: RwLock::new(HashMap::new()),
            closed,
        }
    }

    fn partition(&self, topic: &str, partition: u32) -> Arc<Partition> {
        let key = (topic.to_string(), partition);
        if let Some(existing) = self.topics.read().get(&key) {
            return existing.clone();
        }
        self.topics.write().entry(key).or_default().clone()
    }

    fn check_partition(&self, partition: u32) -> Result<()> {
        if partition >= self.partitions {
            return Err(RelayError::Backend(format!(
                "partition {partition} out of range (0..{})",
                self.partitions
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LogBroker for MemoryLog {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<LogPosition> {
        if *self.closed.borrow() {
            return Err(RelayError::Backend("log is closed".into()));
        }
        let partition_id = self.partition_for(key);
        let partition = self.partition(topic, partition_id);
        let offset = {
            let mut records = partition.records.write();
            let offset = records.len() as u64;
            records.push(LogRecord {
                topic: topic.to_string(),
                partition: partition_id,
                offset,
                key: Bytes::copy_from_slice(key),
                payload,
                timestamp: Utc::now(),
            });
            offset
        };
        partition.appended.notify_waiters();
        Ok(LogPosition {
            partition: partition_id,
            offset,
        })
    }

    async fn consume(&self, topic: &str, partition: u32, start: StartOffset) -> Result<LogStream> {
        self.check_partition(partition)?;
        let log = self.partition(topic, partition);
        let mut closed = self.closed.subscribe();
        let mut next = match start {
            StartOffset::Earliest => 0,
            StartOffset::Latest => log.len(),
            StartOffset::At(offset) => offset,
        };

        Ok(Box::pin(async_stream::stream! {
            loop {
                let appended = log.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                let batch = log.read_from(next);
                if batch.is_empty() {
                    if *closed.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = &mut appended => {}
                        changed = closed.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }

                for record in batch {
                    next = record.offset + 1;
                    yield Ok(record);
                }
            }
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn consumer_sees_appends_in_order() {
        let log = MemoryLog::new(1);
        let mut stream = log.consume("chat", 0, StartOffset::Latest).await.unwrap();

        for i in 0..3 {
            log.append("chat", b"0", Bytes::from(format!("m{i}"))).await.unwrap();
        }

        for i in 0..3u64 {
            let record = stream.next().await.unwrap().unwrap();
            assert_eq!(record.offset, i);
            assert_eq!(record.payload, Bytes::from(format!("m{i}")));
        }
    }

    #[tokio::test]
    async fn latest_skips_history_and_earliest_replays_it() {
        let log = MemoryLog::new(1);
        log.append("chat", b"0", Bytes::from_static(b"old")).await.unwrap();

        let mut latest = log.consume("chat", 0, StartOffset::Latest).await.unwrap();
        let mut earliest = log.consume("chat", 0, StartOffset::Earliest).await.unwrap();
        log.append("chat", b"0", Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(latest.next().await.unwrap().unwrap().payload, "new");
        assert_eq!(earliest.next().await.unwrap().unwrap().payload, "old");
        assert_eq!(earliest.next().await.unwrap().unwrap().payload, "new");
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_appends() {
        let log = MemoryLog::new(2);
        let partition = log.partition_for(b"0");
        let mut stream = log.consume("chat", partition, StartOffset::Latest).await.unwrap();

        log.close().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
        assert!(log.append("chat", b"0", Bytes::new()).await.is_err());
        assert!(log.consume("chat", 9, StartOffset::Earliest).await.is_err());
    }
}
