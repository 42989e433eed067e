//! One client's socket and its reader/writer tasks.
//!
//! The reader turns inbound frames into transport submissions; the writer
//! drains the outbound buffer onto the socket. Either side, an explicit
//! logout, an eviction or shutdown may request teardown; `close_buffers`
//! is the one-shot that makes all of those converge.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::hub::admission::{admit, drain_backlog, Admission, BoundedBuffer};
use crate::lifecycle::Lifecycle;
use crate::models::ChatRequest;

/// Text sent back on the same socket when a message could not be admitted.
/// Deliberately not envelope JSON.
pub const OVERLOAD_NOTICE: &str =
    "Message not sent: too many users are sending at the same time, please retry later";

/// Inbound half of a client socket.
pub type FrameStream = BoxStream<'static, Result<String>>;
/// Outbound half of a client socket.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;

/// Per-connection buffer sizes.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    /// 0 disables the inbound pending buffer
    pub pending: usize,
    pub outbound: usize,
}

/// An item on a connection's outbound buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Set for routed messages; a successful write marks it `sent`
    pub message_id: Option<String>,
    pub frame: String,
}

impl Delivery {
    pub fn message(id: impl Into<String>, frame: impl Into<String>) -> Self {
        Self {
            message_id: Some(id.into()),
            frame: frame.into(),
        }
    }

    /// A copy that never touches delivery status (sender echo).
    pub fn echo(frame: impl Into<String>) -> Self {
        Self {
            message_id: None,
            frame: frame.into(),
        }
    }
}

pub struct Connection {
    client_id: String,
    session_id: Uuid,
    connected_at: DateTime<Utc>,
    pending: Option<BoundedBuffer<String>>,
    outbound: BoundedBuffer<Delivery>,
    overflow: BoundedBuffer<Delivery>,
    sink: Mutex<Option<FrameSink>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(client_id: impl Into<String>, sink: FrameSink, limits: BufferLimits) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            client_id: client_id.into(),
            session_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            pending: (limits.pending > 0).then(|| BoundedBuffer::new(limits.pending)),
            outbound: BoundedBuffer::new(limits.outbound),
            overflow: BoundedBuffer::new(limits.outbound),
            sink: Mutex::new(Some(sink)),
            closed,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn pending(&self) -> Option<&BoundedBuffer<String>> {
        self.pending.as_ref()
    }

    pub fn outbound(&self) -> &BoundedBuffer<Delivery> {
        &self.outbound
    }

    pub fn overflow(&self) -> &BoundedBuffer<Delivery> {
        &self.overflow
    }

    /// Non-blocking forward onto this connection's outbound buffer,
    /// falling back to the overflow buffer.
    pub fn offer(&self, delivery: Delivery) -> Admission<Delivery> {
        admit(&self.outbound, Some(&self.overflow), delivery)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once teardown has started.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close every buffer. Only the first call does anything and returns true.
    pub fn close_buffers(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        self.outbound.close();
        self.overflow.close();
        if let Some(pending) = &self.pending {
            pending.close();
        }
        true
    }

    /// Write one frame to the socket.
    pub async fn write_frame(&self, frame: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(RelayError::ConnectionClosed)?;
        sink.send(frame).await
    }

    /// Close the socket's outbound half. Safe to call repeatedly.
    pub async fn close_socket(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!("[Conn] {} socket close: {}", self.client_id, e);
            }
        }
    }
}

/// Inbound loop: one frame at a time until the socket breaks or teardown
/// starts. A broken read is terminal.
pub(crate) async fn read_loop(
    conn: Arc<Connection>,
    mut frames: FrameStream,
    lifecycle: Arc<Lifecycle>,
) {
    debug!("[Conn] reader started for {}", conn.client_id());
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.closed() => break,
            next = frames.next() => next,
        };

        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(RelayError::ConnectionClosed)) | None => {
                debug!("[Conn] {} closed the socket", conn.client_id());
                break;
            }
            Some(Err(e)) => {
                warn!("[Conn] read from {} failed: {}", conn.client_id(), e);
                break;
            }
        };

        if let Err(e) = handle_frame(&conn, text, &lifecycle).await {
            warn!("[Conn] dropping {}: {}", conn.client_id(), e);
            break;
        }
    }
    lifecycle.teardown(&conn).await;
}

async fn handle_frame(conn: &Connection, text: String, lifecycle: &Lifecycle) -> Result<()> {
    let request: ChatRequest = match serde_json::from_str(&text) {
        Ok(request) => request,
        Err(e) => {
            warn!("[Conn] undecodable frame from {}: {}", conn.client_id(), e);
            return Ok(());
        }
    };
    if request.sender != conn.client_id() {
        warn!(
            "[Conn] {} tried to send as {}, frame skipped",
            conn.client_id(),
            request.sender
        );
        return Ok(());
    }

    match lifecycle.transport().submit(conn, text).await {
        Ok(Admission::Direct) | Ok(Admission::Buffered) => Ok(()),
        Ok(Admission::Rejected(_)) => {
            warn!("[Conn] overloaded, rejecting message from {}", conn.client_id());
            tokio::select! {
                biased;
                _ = conn.closed() => Ok(()),
                written = conn.write_frame(OVERLOAD_NOTICE.to_string()) => written,
            }
        }
        Ok(Admission::Closed(_)) => Err(RelayError::TransportClosed),
        Err(e) => {
            // log backend unreachable: drop, keep serving the socket
            warn!("[Conn] submit from {} failed, message dropped: {}", conn.client_id(), e);
            Ok(())
        }
    }
}

/// Outbound loop: drains the outbound buffer onto the socket.
pub(crate) async fn write_loop(conn: Arc<Connection>, lifecycle: Arc<Lifecycle>) {
    debug!("[Conn] writer started for {}", conn.client_id());
    loop {
        let delivery = tokio::select! {
            biased;
            _ = conn.closed() => break,
            next = conn.outbound().recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        // a slot just opened; let parked deliveries move up in order
        drain_backlog(conn.outbound(), conn.overflow());

        let written = tokio::select! {
            biased;
            _ = conn.closed() => break,
            written = conn.write_frame(delivery.frame) => written,
        };
        if let Err(e) = written {
            warn!("[Conn] write to {} failed: {}", conn.client_id(), e);
            break;
        }

        if let Some(id) = delivery.message_id {
            lifecycle.mark_sent(id);
        }
    }
    info!("[Conn] writer for {} stopped", conn.client_id());
    lifecycle.teardown(&conn).await;
}
