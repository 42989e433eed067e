//! Connection lifecycle and process-wide startup/shutdown.
//!
//! Login registers a connection and starts its reader and writer; every
//! exit path (socket error, explicit logout, eviction by a newer login,
//! shutdown) funnels into `teardown`, which is safe to call any number of
//! times for the same connection.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connection::{self, BufferLimits, Connection, FrameSink, FrameStream};
use crate::directory::ClusterDirectory;
use crate::error::{RelayError, Result};
use crate::hub::{Hub, Registry, Removal};
use crate::models::{DeliveryStatus, PresenceEvent};
use crate::store::MessageStore;
use crate::transport::{PresenceStream, Transport};

pub struct Lifecycle {
    hub: Arc<Hub>,
    directory: Arc<ClusterDirectory>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn MessageStore>,
    limits: BufferLimits,
    node_id: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    /// Fails when `config` does not describe usable buffers.
    pub fn new(
        config: &RelayConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = Registry::new();
        let directory = Arc::new(ClusterDirectory::new(
            config.node_id.clone(),
            registry.clone(),
        ));
        let hub = Arc::new(Hub::new(
            registry,
            directory.clone(),
            store.clone(),
            config.echo_to_sender,
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            hub,
            directory,
            transport,
            store,
            limits: BufferLimits {
                pending: config.pending_capacity,
                outbound: config.outbound_capacity,
            },
            node_id: config.node_id.clone(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &Registry {
        self.hub.registry()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Start one dispatch task per transport subscription, plus the
    /// presence follower when the transport spans processes.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let streams = self.transport.subscribe().await?;
        let mut handles = Vec::with_capacity(streams.len() + 1);
        for records in streams {
            let hub = self.hub.clone();
            handles.push(tokio::spawn(hub.run(records)));
        }

        if let Some(events) = self.transport.presence().await? {
            handles.push(tokio::spawn(follow_presence(
                self.directory.clone(),
                events,
                self.shutdown.subscribe(),
            )));
        }

        info!(
            "[Lifecycle] {} started on {} ({} tasks)",
            self.transport.name(),
            self.node_id,
            handles.len()
        );
        self.tasks.lock().extend(handles);
        Ok(())
    }

    /// Register a client socket and start its reader and writer. A previous
    /// connection under the same id is torn down first.
    pub async fn login(
        self: &Arc<Self>,
        client_id: &str,
        frames: FrameStream,
        sink: FrameSink,
    ) -> Result<Arc<Connection>> {
        if self.is_shutting_down() {
            return Err(RelayError::TransportClosed);
        }

        if let Some(existing) = self.registry().get(client_id) {
            info!("[Lifecycle] {} logged in again, replacing old session", client_id);
            self.teardown(&existing).await;
        }

        let conn = Arc::new(Connection::new(client_id, sink, self.limits));
        // lost a race with a concurrent login for the same id
        if let Some(displaced) = self.registry().insert(conn.clone()) {
            self.teardown(&displaced).await;
        }

        if let Err(e) = self
            .transport
            .announce(PresenceEvent::login(
                client_id,
                self.node_id.clone(),
                conn.session_id(),
            ))
            .await
        {
            warn!("[Lifecycle] failed to announce login of {}: {}", client_id, e);
        }

        tokio::spawn(connection::read_loop(conn.clone(), frames, self.clone()));
        tokio::spawn(connection::write_loop(conn.clone(), self.clone()));

        info!(
            "[Lifecycle] {} connected (session {}, {} online)",
            client_id,
            conn.session_id(),
            self.registry().len()
        );
        Ok(conn)
    }

    /// Explicit logout. Returns false when the id was not connected here.
    pub async fn logout(&self, client_id: &str) -> bool {
        match self.registry().get(client_id) {
            Some(conn) => self.teardown(&conn).await.removed,
            None => {
                debug!("[Lifecycle] logout for unknown {}", client_id);
                false
            }
        }
    }

    /// Unregister, close buffers and close the socket. Idempotent.
    pub async fn teardown(&self, conn: &Connection) -> Removal {
        let removal = self.registry().remove_and_close(conn);
        if removal.removed {
            info!("[Lifecycle] {} disconnected", conn.client_id());
            if let Err(e) = self
                .transport
                .announce(PresenceEvent::logout(
                    conn.client_id(),
                    self.node_id.clone(),
                    conn.session_id(),
                ))
                .await
            {
                warn!(
                    "[Lifecycle] failed to announce logout of {}: {}",
                    conn.client_id(),
                    e
                );
            }
        }
        if removal.closed {
            conn.close_socket().await;
        }
        removal
    }

    /// Record that a routed message reached its recipient's socket.
    pub fn mark_sent(&self, message_id: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            match store.update_status(&message_id, DeliveryStatus::Sent).await {
                Ok(true) => {}
                Ok(false) => debug!("[Lifecycle] {} not advanced to sent", message_id),
                Err(e) => error!("[Lifecycle] failed to mark {} sent: {}", message_id, e),
            }
        });
    }

    /// Stop accepting work, disconnect everyone, release the transport and
    /// wait for background tasks.
    ///
    /// Nothing a reader already admitted is lost: dispatch keeps running
    /// until the closed transport has handed over every queued record, and
    /// whatever is left on a connection's pending buffer is routed after
    /// that, so it is at least persisted as `pending`.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("[Lifecycle] shutting down");

        let connections = self.registry().connections();
        for conn in &connections {
            self.teardown(conn).await;
        }

        if let Err(e) = self.transport.close().await {
            warn!("[Lifecycle] transport close failed: {}", e);
        }

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("[Lifecycle] background task failed: {}", e);
            }
        }

        for conn in &connections {
            self.flush_pending(conn).await;
        }

        self.registry().clear();
        self.directory.purge();
        info!("[Lifecycle] shutdown complete");
    }

    /// Route what never made it from a closed connection's pending buffer
    /// onto the transport, oldest first.
    async fn flush_pending(&self, conn: &Connection) {
        let Some(pending) = conn.pending() else {
            return;
        };
        let mut flushed = 0;
        while let Some(payload) = pending.try_pop() {
            match self.hub.route(&payload).await {
                Ok(_) => flushed += 1,
                Err(e) => warn!(
                    "[Lifecycle] dropping pending message from {}: {}",
                    conn.client_id(),
                    e
                ),
            }
        }
        if flushed > 0 {
            info!(
                "[Lifecycle] flushed {} pending messages from {}",
                flushed,
                conn.client_id()
            );
        }
    }
}

async fn follow_presence(
    directory: Arc<ClusterDirectory>,
    mut events: PresenceStream,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            next = events.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        directory.apply_presence(&event);
    }
    debug!("[Lifecycle] presence follower stopped");
}
