//! Transports carry admitted messages from connection readers to the hub.
//!
//! Two interchangeable variants are selected once at startup from
//! configuration; nothing else branches on which one is running.

pub mod distributed;
pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{MessageMode, RelayConfig};
use crate::connection::Connection;
use crate::error::Result;
use crate::hub::admission::Admission;
use crate::log::FileLog;
use crate::models::PresenceEvent;

pub use distributed::DistributedQueue;
pub use local::LocalChannel;

/// Where an inbound record was read from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    Queue,
    Log { partition: u32, offset: u64 },
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordOrigin::Queue => f.write_str("transmit queue"),
            RecordOrigin::Log { partition, offset } => write!(f, "log {partition}@{offset}"),
        }
    }
}

/// A raw inbound payload awaiting routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub payload: String,
    pub origin: RecordOrigin,
    /// Envelope id every consumer of this record must agree on. `None`
    /// lets the hub mint a fresh one.
    pub envelope_id: Option<String>,
}

pub type RecordStream = BoxStream<'static, InboundRecord>;
pub type PresenceStream = BoxStream<'static, PresenceEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand one raw message from `conn` to the hub. `Err` means the backend
    /// is unreachable and the message is lost.
    async fn submit(&self, conn: &Connection, raw: String) -> Result<Admission<String>>;

    /// Streams the hub should drain, one dispatch task each.
    async fn subscribe(&self) -> Result<Vec<RecordStream>>;

    /// Tell other processes a client logged in or out.
    async fn announce(&self, event: PresenceEvent) -> Result<()>;

    /// Presence records published by other processes, if this transport
    /// spans processes.
    async fn presence(&self) -> Result<Option<PresenceStream>>;

    /// Release queues, producers and consumers.
    async fn close(&self) -> Result<()>;
}

/// Build the transport the configuration asks for.
pub async fn from_config(config: &RelayConfig) -> Result<Arc<dyn Transport>> {
    match config.message_mode {
        MessageMode::Channel => {
            info!(
                "[Transport] local channel, transmit capacity {}",
                config.transmit_capacity
            );
            Ok(Arc::new(LocalChannel::new(config.transmit_capacity)))
        }
        MessageMode::Log => {
            let broker = FileLog::open(config.log_dir(), config.partitions).await?;
            info!(
                "[Transport] distributed log, node {} shard {}",
                config.node_id, config.shard
            );
            Ok(Arc::new(DistributedQueue::new(Arc::new(broker), config)))
        }
    }
}
