//! The routing step and the dispatch loop that drives it.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::registry::Forward;
use super::Hub;
use crate::connection::Delivery;
use crate::directory::Resolution;
use crate::error::{RelayError, Result};
use crate::models::{ChatRequest, DeliveryStatus, Envelope};
use crate::transport::RecordStream;

/// What happened to one routed envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub envelope_id: String,
    /// Placed on a recipient's outbound buffer
    pub delivered: usize,
    /// Parked on a recipient's overflow buffer
    pub deferred: usize,
    /// Both recipient buffers full
    pub rejected: usize,
    /// Recipient connected to another node
    pub remote: usize,
    /// Recipient not connected anywhere
    pub offline: usize,
}

impl RouteReport {
    fn new(envelope_id: &str) -> Self {
        Self {
            envelope_id: envelope_id.to_string(),
            ..Self::default()
        }
    }
}

impl Hub {
    /// Decode one raw inbound payload, persist it and forward it to every
    /// locally connected target.
    pub async fn route(&self, payload: &str) -> Result<RouteReport> {
        self.route_as(payload, None).await
    }

    /// Like `route`, but with a caller-chosen envelope id.
    pub async fn route_as(&self, payload: &str, envelope_id: Option<String>) -> Result<RouteReport> {
        let request: ChatRequest = serde_json::from_str(payload)?;
        if request.recipient.is_empty() {
            return Err(RelayError::Protocol("message has no recipient".into()));
        }

        let mut envelope = Envelope::from_request(request);
        if let Some(id) = envelope_id {
            envelope.id = id;
        }
        if let Err(e) = self.store.create_message(&envelope).await {
            error!("[Hub] failed to persist {}: {}", envelope.id, e);
        }

        let frame = serde_json::to_string(&envelope.to_frame())?;
        let mut report = RouteReport::new(&envelope.id);

        let targets = self.targets(&envelope);
        for target in &targets {
            match self.directory.resolve(target) {
                Resolution::Local => {
                    let delivery = Delivery::message(&envelope.id, frame.clone());
                    match self.registry.forward(target, delivery) {
                        Forward::Delivered => report.delivered += 1,
                        Forward::Deferred => {
                            debug!("[Hub] {} backed up, {} parked", target, envelope.id);
                            report.deferred += 1;
                        }
                        Forward::Rejected(_) => {
                            warn!("[Hub] {} is not draining, {} rejected", target, envelope.id);
                            report.rejected += 1;
                        }
                        // logged out between resolve and forward
                        Forward::Absent(_) => report.offline += 1,
                    }
                }
                Resolution::NotLocal { node_id } => {
                    debug!("[Hub] {} is on {}, leaving {} pending", target, node_id, envelope.id);
                    report.remote += 1;
                }
                Resolution::Unknown => report.offline += 1,
            }
        }

        if !envelope.is_group() && report.rejected > 0 {
            if let Err(e) = self
                .store
                .update_status(&envelope.id, DeliveryStatus::Failed)
                .await
            {
                warn!("[Hub] failed to mark {} failed: {}", envelope.id, e);
            }
        }

        if self.echo_to_sender && !targets.contains(&envelope.sender) {
            if let Forward::Rejected(_) = self
                .registry
                .forward(&envelope.sender, Delivery::echo(frame))
            {
                debug!("[Hub] echo to {} skipped, buffers full", envelope.sender);
            }
        }

        Ok(report)
    }

    fn targets(&self, envelope: &Envelope) -> Vec<String> {
        if !envelope.is_group() {
            return vec![envelope.recipient.clone()];
        }
        match self.directory.group_members(&envelope.recipient) {
            Some(members) => members
                .into_iter()
                .filter(|member| member != &envelope.sender)
                .collect(),
            None => {
                warn!("[Hub] unknown group {}, {} left pending", envelope.recipient, envelope.id);
                Vec::new()
            }
        }
    }

    /// Drain one subscription until it ends. Closing the transport ends it
    /// only after every record already admitted has been routed. Failures
    /// are isolated per record.
    pub async fn run(self: Arc<Self>, mut records: RecordStream) {
        info!("[Hub] dispatch loop started");
        while let Some(record) = records.next().await {
            match self.route_as(&record.payload, record.envelope_id).await {
                Ok(report) => debug!("[Hub] routed {:?}", report),
                Err(e) => warn!("[Hub] skipping record from {}: {}", record.origin, e),
            }
        }
        info!("[Hub] dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BufferLimits, Connection, FrameSink};
    use crate::directory::ClusterDirectory;
    use crate::hub::Registry;
    use crate::models::PresenceEvent;
    use crate::store::{MemoryMessageStore, MessageStore};
    use futures::SinkExt;

    fn connection(id: &str, outbound: usize) -> Arc<Connection> {
        let (tx, _rx) = futures::channel::mpsc::unbounded::<String>();
        let sink: FrameSink = Box::pin(tx.sink_map_err(|e| RelayError::Socket(e.to_string())));
        Arc::new(Connection::new(
            id,
            sink,
            BufferLimits {
                pending: 1,
                outbound,
            },
        ))
    }

    fn hub(echo: bool) -> (Hub, Arc<ClusterDirectory>, Arc<MemoryMessageStore>) {
        let registry = Registry::new();
        let directory = Arc::new(ClusterDirectory::new("node-a", registry.clone()));
        let store = Arc::new(MemoryMessageStore::new());
        let hub = Hub::new(registry, directory.clone(), store.clone(), echo);
        (hub, directory, store)
    }

    fn payload(sender: &str, recipient: &str, content: &str) -> String {
        serde_json::json!({
            "sender": sender,
            "recipient": recipient,
            "content": content,
            "contentType": "text",
        })
        .to_string()
    }

    #[tokio::test]
    async fn offline_recipient_is_persisted_pending() {
        let (hub, _, store) = hub(false);
        let report = hub.route(&payload("U1", "U2", "hi")).await.unwrap();

        assert_eq!(report.offline, 1);
        assert_eq!(report.delivered, 0);
        let stored = store.get_message(&report.envelope_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn remote_recipient_is_left_pending() {
        let (hub, directory, store) = hub(false);
        directory.apply_presence(&PresenceEvent::login("U2", "node-b", uuid::Uuid::new_v4()));

        let report = hub.route(&payload("U1", "U2", "hi")).await.unwrap();
        assert_eq!(report.remote, 1);
        let stored = store.get_message(&report.envelope_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn local_recipient_gets_frame() {
        let (hub, _, _) = hub(false);
        let bob = connection("U2", 4);
        hub.registry().insert(bob.clone());

        let report = hub.route(&payload("U1", "U2", "hi")).await.unwrap();
        assert_eq!(report.delivered, 1);

        let delivery = bob.outbound().try_pop().unwrap();
        assert_eq!(delivery.message_id.as_deref(), Some(report.envelope_id.as_str()));
        let frame: crate::models::OutboundFrame = serde_json::from_str(&delivery.frame).unwrap();
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.sender, "U1");
    }

    #[tokio::test]
    async fn full_recipient_marks_direct_message_failed() {
        let (hub, _, store) = hub(false);
        let bob = connection("U2", 1);
        hub.registry().insert(bob.clone());

        hub.route(&payload("U1", "U2", "1")).await.unwrap();
        let parked = hub.route(&payload("U1", "U2", "2")).await.unwrap();
        assert_eq!(parked.deferred, 1);
        let rejected = hub.route(&payload("U1", "U2", "3")).await.unwrap();
        assert_eq!(rejected.rejected, 1);

        let stored = store.get_message(&rejected.envelope_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn group_fans_out_to_members_except_sender() {
        let (hub, directory, _) = hub(false);
        directory.set_group_members("G1", vec!["U1".into(), "U2".into(), "U3".into()]);
        let alice = connection("U1", 4);
        let bob = connection("U2", 4);
        hub.registry().insert(alice.clone());
        hub.registry().insert(bob.clone());

        let report = hub.route(&payload("U1", "G1", "hello all")).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.offline, 1);
        assert!(alice.outbound().is_empty());
        assert_eq!(bob.outbound().len(), 1);
    }

    #[tokio::test]
    async fn echo_reaches_sender_without_message_id() {
        let (hub, _, _) = hub(true);
        let alice = connection("U1", 4);
        hub.registry().insert(alice.clone());

        hub.route(&payload("U1", "U2", "hi")).await.unwrap();
        let echo = alice.outbound().try_pop().unwrap();
        assert!(echo.message_id.is_none());
    }

    #[tokio::test]
    async fn shared_envelope_id_is_stored_once() {
        let (first, _, store) = hub(false);
        let second = Hub::new(
            Registry::new(),
            Arc::new(ClusterDirectory::new("node-b", Registry::new())),
            store.clone(),
            false,
        );
        let raw = payload("U1", "U2", "once");

        let a = first.route_as(&raw, Some("Mshared".into())).await.unwrap();
        let b = second.route_as(&raw, Some("Mshared".into())).await.unwrap();
        assert_eq!(a.envelope_id, b.envelope_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn run_routes_every_record_before_returning() {
        let (hub, _, store) = hub(false);
        let mut records: Vec<_> = (0..5)
            .map(|i| payload("U1", "U2", &format!("msg-{i}")))
            .collect();
        records.insert(2, "not json".to_string());
        let stream = futures::stream::iter(records.into_iter().map(|payload| {
            crate::transport::InboundRecord {
                payload,
                origin: crate::transport::RecordOrigin::Queue,
                envelope_id: None,
            }
        }))
        .boxed();

        Arc::new(hub).run(stream).await;

        let stored = store
            .find_messages(&crate::store::MessageFilter::default())
            .await
            .unwrap();
        let contents: Vec<_> = stored.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_an_error() {
        let (hub, _, store) = hub(false);
        assert!(hub.route("not json").await.is_err());
        assert!(hub.route(&payload("U1", "", "x")).await.is_err());
        assert_eq!(store.len(), 0);
    }
}
