//! Message persistence

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DeliveryStatus, Envelope};

pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;

/// Selection for `find_messages`. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Both directions of a one-to-one conversation
    pub conversation: Option<(String, String)>,
    /// Everything addressed to one id (typically a group)
    pub recipient: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn conversation(user_one: impl Into<String>, user_two: impl Into<String>) -> Self {
        Self {
            conversation: Some((user_one.into(), user_two.into())),
            ..Self::default()
        }
    }

    pub fn to_recipient(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some((a, b)) = &self.conversation {
            let forward = &envelope.sender == a && &envelope.recipient == b;
            let backward = &envelope.sender == b && &envelope.recipient == a;
            if !(forward || backward) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if &envelope.recipient != recipient {
                return false;
            }
        }
        if let Some(status) = self.status {
            if envelope.status != status {
                return false;
            }
        }
        true
    }
}

/// Durable record of every routed envelope and its delivery status.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record a new envelope. Re-creating an existing id is a no-op.
    async fn create_message(&self, envelope: &Envelope) -> Result<String>;

    /// Move an envelope's status forward. Returns false (not an error) when
    /// the target is not later than the current status or the id is unknown.
    async fn update_status(&self, id: &str, status: DeliveryStatus) -> Result<bool>;

    /// Matching envelopes, oldest first.
    async fn find_messages(&self, filter: &MessageFilter) -> Result<Vec<Envelope>>;

    async fn get_message(&self, id: &str) -> Result<Option<Envelope>>;

    async fn close(&self) {}
}
