//! Routing registry: client id -> live connection.
//!
//! Forwarding runs under the read lock and removal closes buffers under the
//! write lock, so a registered connection never has a closed outbound
//! buffer from a forwarder's point of view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::{Connection, Delivery};
use crate::hub::admission::Admission;

/// Result of forwarding one delivery to a client.
#[derive(Debug, PartialEq)]
pub enum Forward {
    /// On the outbound buffer
    Delivered,
    /// Parked on the overflow buffer until the writer catches up
    Deferred,
    /// Outbound and overflow both full
    Rejected(Delivery),
    /// Nobody registered under that id
    Absent(Delivery),
}

/// What `remove_and_close` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// The registry entry belonged to this connection and was removed
    pub removed: bool,
    /// This call closed the buffers
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning whatever it displaced.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.inner
            .write()
            .insert(conn.client_id().to_string(), conn)
    }

    /// Unregister `conn` (only if it is still the registered session) and
    /// close its buffers in the same critical section.
    pub fn remove_and_close(&self, conn: &Connection) -> Removal {
        let mut map = self.inner.write();
        let owned = map
            .get(conn.client_id())
            .is_some_and(|current| current.session_id() == conn.session_id());
        if owned {
            map.remove(conn.client_id());
        }
        let closed = conn.close_buffers();
        Removal {
            removed: owned,
            closed,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().get(client_id).cloned()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.read().contains_key(client_id)
    }

    /// Offer a delivery to a registered client without blocking.
    pub fn forward(&self, client_id: &str, delivery: Delivery) -> Forward {
        let map = self.inner.read();
        let Some(conn) = map.get(client_id) else {
            return Forward::Absent(delivery);
        };
        match conn.offer(delivery) {
            Admission::Direct => Forward::Delivered,
            Admission::Buffered => Forward::Deferred,
            Admission::Rejected(delivery) => Forward::Rejected(delivery),
            Admission::Closed(delivery) => Forward::Absent(delivery),
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop every entry without touching the connections.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BufferLimits, FrameSink};
    use crate::error::RelayError;
    use futures::SinkExt;

    fn conn(id: &str) -> Arc<Connection> {
        let (tx, _rx) = futures::channel::mpsc::unbounded::<String>();
        let sink: FrameSink = Box::pin(tx.sink_map_err(|e| RelayError::Socket(e.to_string())));
        Arc::new(Connection::new(
            id,
            sink,
            BufferLimits {
                pending: 1,
                outbound: 1,
            },
        ))
    }

    #[test]
    fn second_login_displaces_first() {
        let registry = Registry::new();
        let first = conn("U1");
        let second = conn("U1");

        assert!(registry.insert(first.clone()).is_none());
        let displaced = registry.insert(second.clone()).unwrap();
        assert_eq!(displaced.session_id(), first.session_id());
        assert_eq!(registry.len(), 1);

        // tearing down the stale session must not unregister the new one
        let removal = registry.remove_and_close(&first);
        assert!(!removal.removed);
        assert!(removal.closed);
        assert!(registry.contains("U1"));
    }

    #[test]
    fn remove_twice_closes_once() {
        let registry = Registry::new();
        let c = conn("U1");
        registry.insert(c.clone());

        assert_eq!(
            registry.remove_and_close(&c),
            Removal {
                removed: true,
                closed: true
            }
        );
        assert_eq!(
            registry.remove_and_close(&c),
            Removal {
                removed: false,
                closed: false
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn forward_reports_absent_and_rejected() {
        let registry = Registry::new();
        assert!(matches!(
            registry.forward("ghost", Delivery::echo("x")),
            Forward::Absent(_)
        ));

        registry.insert(conn("U1"));
        assert_eq!(registry.forward("U1", Delivery::echo("a")), Forward::Delivered);
        assert_eq!(registry.forward("U1", Delivery::echo("b")), Forward::Deferred);
        assert!(matches!(
            registry.forward("U1", Delivery::echo("c")),
            Forward::Rejected(_)
        ));
    }
}
