//! Partitioned append-only log used by the distributed transport.
//!
//! A topic is split into a fixed number of partitions. Records with the same
//! key always land on the same partition, and each partition is read back in
//! append order.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use futures::stream::BoxStream;

use crate::error::Result;

pub use file::FileLog;
pub use memory::MemoryLog;

const KEY_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Stable key -> partition mapping, identical on every process.
pub fn partition_for_key(key: &[u8], partitions: u32) -> u32 {
    KEY_HASH.checksum(key) % partitions.max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Bytes,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub partition: u32,
    pub offset: u64,
}

/// Where a new consumer begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Earliest,
    /// Only records appended after subscribing
    Latest,
    At(u64),
}

pub type LogStream = BoxStream<'static, Result<LogRecord>>;

#[async_trait]
pub trait LogBroker: Send + Sync {
    fn partitions(&self) -> u32;

    fn partition_for(&self, key: &[u8]) -> u32 {
        partition_for_key(key, self.partitions())
    }

    async fn append(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<LogPosition>;

    /// Tail one partition. The stream ends once the broker is closed.
    async fn consume(&self, topic: &str, partition: u32, start: StartOffset) -> Result<LogStream>;

    /// Stop accepting appends and end every consumer stream.
    async fn close(&self) -> Result<()>;
}
