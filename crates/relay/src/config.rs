//! Relay server configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::lifecycle::Lifecycle;
use crate::store::MessageStore;

/// Which transport carries inbound messages to the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageMode {
    /// In-process bounded channels
    Channel,
    /// Durable partitioned log
    Log,
}

impl FromStr for MessageMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "channel" => Ok(MessageMode::Channel),
            "log" | "kafka" => Ok(MessageMode::Log),
            other => Err(RelayError::Config(format!("unknown message mode {other}"))),
        }
    }
}

/// Topic names used by the log backend
#[derive(Clone, Debug)]
pub struct TopicConfig {
    pub chat: String,
    pub login: String,
    pub logout: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            chat: env_or("RELAY_CHAT_TOPIC", "chat_message".to_string()),
            login: env_or("RELAY_LOGIN_TOPIC", "login".to_string()),
            logout: env_or("RELAY_LOGOUT_TOPIC", "logout".to_string()),
        }
    }
}

/// Configuration for the relay server
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Root for the message database and the on-disk log
    pub data_dir: PathBuf,
    /// Transport selection
    pub message_mode: MessageMode,
    /// Capacity of the shared transmit queue
    pub transmit_capacity: usize,
    /// Capacity of each connection's pending buffer (0 disables it)
    pub pending_capacity: usize,
    /// Capacity of each connection's outbound buffer and its overflow
    pub outbound_capacity: usize,
    pub topics: TopicConfig,
    /// Partition count of every log topic
    pub partitions: u32,
    /// Routing shard used as the partition key for chat records
    pub shard: u32,
    /// Chat partitions this process consumes. Empty means only the
    /// partition its own shard maps to.
    pub assigned_partitions: Vec<u32>,
    /// Identity of this process in presence records
    pub node_id: String,
    /// Send each message back to its sender's socket as well
    pub echo_to_sender: bool,
    /// Consume log topics from offset 0 instead of the tail
    pub log_from_start: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: env_or("RELAY_HOST", "0.0.0.0".to_string()),
            port: env_or("RELAY_PORT", 8000),
            data_dir: std::env::var("RELAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("relay_data")),
            message_mode: env_or("RELAY_MESSAGE_MODE", MessageMode::Channel),
            transmit_capacity: env_or("RELAY_TRANSMIT_CAPACITY", 100),
            pending_capacity: env_or("RELAY_PENDING_CAPACITY", 100),
            outbound_capacity: env_or("RELAY_OUTBOUND_CAPACITY", 100),
            topics: TopicConfig::default(),
            partitions: env_or("RELAY_PARTITIONS", 1),
            shard: env_or("RELAY_SHARD", 0),
            assigned_partitions: env_list("RELAY_ASSIGNED_PARTITIONS"),
            node_id: std::env::var("RELAY_NODE_ID").unwrap_or_else(|_| {
                format!("relay-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
            }),
            echo_to_sender: env_or("RELAY_ECHO_TO_SENDER", true),
            log_from_start: env_or("RELAY_LOG_FROM_START", false),
        }
    }
}

impl RelayConfig {
    /// Create config rooted at a custom data directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("messages.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        if self.message_mode == MessageMode::Log {
            tokio::fs::create_dir_all(self.log_dir()).await?;
        }
        Ok(())
    }

    /// Reject settings the channels cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.transmit_capacity == 0 {
            return Err(RelayError::Config("transmit capacity must be positive".into()));
        }
        if self.outbound_capacity == 0 {
            return Err(RelayError::Config("outbound capacity must be positive".into()));
        }
        if self.partitions == 0 {
            return Err(RelayError::Config("partition count must be positive".into()));
        }
        if let Some(partition) = self
            .assigned_partitions
            .iter()
            .find(|&&partition| partition >= self.partitions)
        {
            return Err(RelayError::Config(format!(
                "assigned partition {partition} is out of range for {} partitions",
                self.partitions
            )));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Comma separated list; unparsable entries are skipped.
fn env_list<T: FromStr>(key: &str) -> Vec<T> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .filter_map(|item| item.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub lifecycle: Arc<Lifecycle>,
    pub store: Arc<dyn MessageStore>,
}
