//! Recipient resolution and consumed group membership.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;
use tracing::debug;

use crate::hub::registry::Registry;
use crate::models::{PresenceEvent, PresenceKind};

/// Where a client id currently lives, from this process's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Registered on this process
    Local,
    /// Logged in on another node
    NotLocal { node_id: String },
    /// Not known to be online anywhere
    Unknown,
}

pub trait Directory: Send + Sync {
    fn resolve(&self, client_id: &str) -> Resolution;

    /// Members of a group, if the group is known.
    fn group_members(&self, group_id: &str) -> Option<Vec<String>>;
}

#[derive(Debug, Clone)]
struct Presence {
    node_id: String,
    session_id: Uuid,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct PresenceState {
    online: HashMap<String, Presence>,
    /// Sessions whose logout arrived before their login
    ended: HashSet<Uuid>,
}

/// Client id -> node id, fed by login/logout records from other nodes.
///
/// Login and logout travel on separate topics, so one client's records can
/// arrive in any order. A logout only ends the session it names, and a login
/// older than the one already applied is ignored.
#[derive(Default)]
pub struct PresenceView {
    state: RwLock<PresenceState>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one presence record. Records from `own_node` are ignored since
    /// the local registry is authoritative for them.
    pub fn apply(&self, event: &PresenceEvent, own_node: &str) {
        if event.node_id == own_node {
            return;
        }
        let mut state = self.state.write();
        match event.kind {
            PresenceKind::Login => {
                if state.ended.remove(&event.session_id) {
                    return;
                }
                let newer = state
                    .online
                    .get(&event.client_id)
                    .is_none_or(|current| current.at <= event.at);
                if newer {
                    state.online.insert(
                        event.client_id.clone(),
                        Presence {
                            node_id: event.node_id.clone(),
                            session_id: event.session_id,
                            at: event.at,
                        },
                    );
                }
            }
            PresenceKind::Logout => match state.online.get(&event.client_id) {
                Some(current) if current.session_id == event.session_id => {
                    state.online.remove(&event.client_id);
                }
                // a newer session already replaced this one
                Some(current) if current.at > event.at => {}
                _ => {
                    state.ended.insert(event.session_id);
                }
            },
        }
    }

    pub fn node_of(&self, client_id: &str) -> Option<String> {
        self.state
            .read()
            .online
            .get(client_id)
            .map(|presence| presence.node_id.clone())
    }

    pub fn len(&self) -> usize {
        self.state.read().online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().online.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.online.clear();
        state.ended.clear();
    }
}

/// Directory backed by the local registry, the presence view and a group
/// table supplied from outside.
pub struct ClusterDirectory {
    node_id: String,
    registry: Registry,
    presence: PresenceView,
    groups: RwLock<HashMap<String, Vec<String>>>,
}

impl ClusterDirectory {
    pub fn new(node_id: impl Into<String>, registry: Registry) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            presence: PresenceView::new(),
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn presence(&self) -> &PresenceView {
        &self.presence
    }

    pub fn apply_presence(&self, event: &PresenceEvent) {
        debug!(
            "[Directory] {} {:?} on {}",
            event.client_id, event.kind, event.node_id
        );
        self.presence.apply(event, &self.node_id);
    }

    pub fn set_group_members(&self, group_id: impl Into<String>, members: Vec<String>) {
        self.groups.write().insert(group_id.into(), members);
    }

    pub fn remove_group(&self, group_id: &str) -> Option<Vec<String>> {
        self.groups.write().remove(group_id)
    }

    /// Forget everything learned at runtime.
    pub fn purge(&self) {
        self.presence.clear();
    }
}

impl Directory for ClusterDirectory {
    fn resolve(&self, client_id: &str) -> Resolution {
        if self.registry.contains(client_id) {
            return Resolution::Local;
        }
        match self.presence.node_of(client_id) {
            Some(node_id) => Resolution::NotLocal { node_id },
            None => Resolution::Unknown,
        }
    }

    fn group_members(&self, group_id: &str) -> Option<Vec<String>> {
        self.groups.read().get(group_id).cloned()
    }
}
