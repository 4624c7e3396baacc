//! The pub/sub fan-out device and the per-process client for it.
//!
//! The device is topology glue: publishers push `[topic, body]` frames to
//! its ingress side, subscribers connect to its egress side with prefix
//! subscriptions, and every ingress frame is forwarded to the matching
//! subscribers. No persistence, no acknowledgements; per-publisher FIFO is
//! preserved, nothing else.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MessageBrokerConfig;
use crate::envelope::Envelope;
use crate::frontend::{TopicPublisher, TopicSubscriber};
use crate::net::{
    NetError, PubEndpoint, PullEndpoint, PushEndpoint, SubEndpoint, decode_published_frame,
};
use crate::topic::Topic;

/// The forwarder device behind `weft-broker`.
pub struct BrokerDevice {
    egress: PubEndpoint,
    ingress: PullEndpoint,
    forward_task: JoinHandle<()>,
}

impl BrokerDevice {
    /// Binds both sides and starts forwarding.
    ///
    /// `sub_address` is the ingress side (publishers connect here),
    /// `pub_address` the egress side (subscribers connect here).
    pub async fn bind(sub_address: &str, pub_address: &str) -> Result<Self, NetError> {
        let egress = PubEndpoint::bind(pub_address).await?;
        let (ingress, mut frames) = PullEndpoint::bind(sub_address).await?;
        debug!(
            ingress = %ingress.local_addr(),
            egress = %egress.local_addr(),
            "broker device up"
        );

        let forward_task = tokio::spawn({
            let egress = egress.publish_handle();
            async move {
                while let Some(frame) = frames.recv().await {
                    match decode_published_frame(&frame) {
                        Ok((topic, body, origin)) => {
                            egress.publish_from(&topic, &body, origin.as_deref());
                        }
                        Err(error) => warn!(%error, "dropping unforwardable frame"),
                    }
                }
            }
        });

        Ok(Self {
            egress,
            ingress,
            forward_task,
        })
    }

    /// Address publishers connect to.
    pub fn sub_address(&self) -> std::net::SocketAddr {
        self.ingress.local_addr()
    }

    /// Address subscribers connect to.
    pub fn pub_address(&self) -> std::net::SocketAddr {
        self.egress.local_addr()
    }
}

impl Drop for BrokerDevice {
    fn drop(&mut self) {
        self.forward_task.abort();
    }
}

/// A front-end's connection to the broker device.
///
/// Publishes through a push link to the ingress side and consumes a
/// subscription stream from the egress side. Both links reconnect forever;
/// frames published while the broker is unreachable are dropped. Every
/// client carries a unique origin tag so the device never echoes a
/// process's own publications back to it.
pub struct BrokerClient {
    publisher: PushEndpoint,
    subscriptions: SubEndpoint,
    origin: String,
}

impl BrokerClient {
    /// Opens both links; the receiver yields `(topic, body)` frames.
    pub fn connect(
        config: &MessageBrokerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(String, Bytes)>) {
        static NEXT_CLIENT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let origin = format!(
            "{}:{}",
            std::process::id(),
            NEXT_CLIENT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        let publisher = PushEndpoint::connect(config.sub_address.clone());
        let (subscriptions, frames) = SubEndpoint::new();
        subscriptions.set_origin(&origin);
        subscriptions.connect(&config.pub_address);
        (
            Self {
                publisher,
                subscriptions,
                origin,
            },
            frames,
        )
    }
}

impl TopicPublisher for BrokerClient {
    fn publish(&self, topic: &Topic, envelope: &Envelope) {
        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, %topic, "cannot encode broker publication");
                return;
            }
        };
        let frame = crate::net::encode_parts(&[
            topic.to_string().as_bytes(),
            &body,
            self.origin.as_bytes(),
        ]);
        match frame {
            Ok(frame) => self.publisher.send(frame),
            Err(error) => warn!(%error, %topic, "cannot frame broker publication"),
        }
    }
}

impl TopicSubscriber for BrokerClient {
    fn subscribe(&self, topic: &Topic) {
        self.subscriptions.subscribe(&topic.to_string());
    }

    fn unsubscribe(&self, topic: &Topic) {
        self.subscriptions.unsubscribe(&topic.to_string());
    }
}
