//! In-memory message store

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{MessageFilter, MessageStore};
use crate::error::Result;
use crate::models::{DeliveryStatus, Envelope};

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as creation order
    messages: Vec<Envelope>,
    index: HashMap<String, usize>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_message(&self, envelope: &Envelope) -> Result<String> {
        let mut inner = self.inner.write();
        if !inner.index.contains_key(&envelope.id) {
            let position = inner.messages.len();
            inner.index.insert(envelope.id.clone(), position);
            inner.messages.push(envelope.clone());
        }
        Ok(envelope.id.clone())
    }

    async fn update_status(&self, id: &str, status: DeliveryStatus) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(&position) = inner.index.get(id) else {
            return Ok(false);
        };
        let envelope = &mut inner.messages[position];
        if !status.supersedes(envelope.status) {
            return Ok(false);
        }
        envelope.status = status;
        Ok(true)
    }

    async fn find_messages(&self, filter: &MessageFilter) -> Result<Vec<Envelope>> {
        let inner = self.inner.read();
        let matching = inner.messages.iter().filter(|e| filter.matches(e)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn get_message(&self, id: &str) -> Result<Option<Envelope>> {
        let inner = self.inner.read();
        Ok(inner.index.get(id).map(|&i| inner.messages[i].clone()))
    }
}
