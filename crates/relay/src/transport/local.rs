//! Single-process transport over one bounded transmit queue.

use async_trait::async_trait;
use futures::StreamExt;

use super::{InboundRecord, PresenceStream, RecordOrigin, RecordStream, Transport};
use crate::connection::Connection;
use crate::error::Result;
use crate::hub::admission::{admit, Admission, BoundedBuffer};
use crate::models::PresenceEvent;

pub struct LocalChannel {
    transmit: BoundedBuffer<String>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            transmit: BoundedBuffer::new(capacity),
        }
    }

    pub fn transmit_queue(&self) -> &BoundedBuffer<String> {
        &self.transmit
    }
}

#[async_trait]
impl Transport for LocalChannel {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn submit(&self, conn: &Connection, raw: String) -> Result<Admission<String>> {
        Ok(admit(&self.transmit, conn.pending(), raw))
    }

    async fn subscribe(&self) -> Result<Vec<RecordStream>> {
        let records = self
            .transmit
            .receiver()
            .map(|payload| InboundRecord {
                payload,
                origin: RecordOrigin::Queue,
                envelope_id: None,
            })
            .boxed();
        Ok(vec![records])
    }

    async fn announce(&self, _event: PresenceEvent) -> Result<()> {
        // every connection lives here; the registry already knows
        Ok(())
    }

    async fn presence(&self) -> Result<Option<PresenceStream>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        self.transmit.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BufferLimits, FrameSink};
    use crate::error::RelayError;
    use futures::SinkExt;

    fn connection(pending: usize) -> Connection {
        let (tx, _rx) = futures::channel::mpsc::unbounded::<String>();
        let sink: FrameSink = Box::pin(tx.sink_map_err(|e| RelayError::Socket(e.to_string())));
        Connection::new("U1", sink, BufferLimits { pending, outbound: 1 })
    }

    #[tokio::test]
    async fn pending_backlog_is_drained_before_new_work() {
        let transport = LocalChannel::new(1);
        let conn = connection(2);

        assert_eq!(transport.submit(&conn, "a".into()).await.unwrap(), Admission::Direct);
        assert_eq!(transport.submit(&conn, "b".into()).await.unwrap(), Admission::Buffered);

        let mut streams = transport.subscribe().await.unwrap();
        let first = streams[0].next().await.unwrap();
        assert_eq!(first.payload, "a");

        // "b" moves up first, so "c" waits behind it
        assert_eq!(transport.submit(&conn, "c".into()).await.unwrap(), Admission::Buffered);
        assert_eq!(streams[0].next().await.unwrap().payload, "b");
    }

    #[tokio::test]
    async fn closed_queue_ends_subscription() {
        let transport = LocalChannel::new(4);
        let conn = connection(0);
        let mut streams = transport.subscribe().await.unwrap();

        transport.submit(&conn, "last".into()).await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(streams[0].next().await.unwrap().payload, "last");
        assert!(streams[0].next().await.is_none());
        assert!(matches!(
            transport.submit(&conn, "late".into()).await.unwrap(),
            Admission::Closed(_)
        ));
    }
}
