//! The message manager: inbound cluster traffic of one front-end.
//!
//! Consumes three subscription streams - the broker (uid and channel
//! topics), the location registry announcements, and the aggregated pub
//! streams of every LIVE location - and translates each frame back into a
//! local delivery or a dispatch on the front-end root. A handler failure is
//! logged and never tears a stream down.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectionRegistry, FrontendRoot, TopicSubscriber};
use crate::config::Config;
use crate::dispatch::{Path, Sign, dispatch_with_loopback};
use crate::domain::{Ident, Uid};
use crate::envelope::{Envelope, Kwargs};
use crate::net::{NetError, PushEndpoint, SubEndpoint, encode_parts, request};
use crate::topic::Topic;

/// Timeout of the bootstrap GET_LOCATIONS request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The push link and registration data of one LIVE location.
pub struct LocationLink {
    /// Push link to the location's pull endpoint; envelopes sent here are
    /// dispatched inside the location process.
    pub push: PushEndpoint,
    /// The location's pub address, kept for the matching disconnect.
    pub pub_address: String,
    /// Registration metadata minus the socket addresses.
    pub metadata: Kwargs,
}

/// Live location links, shared between the message manager (writer) and
/// the root (reader, for proxy forwarding).
pub type LocationLinks = DashMap<Ident, LocationLink>;

impl TopicSubscriber for SubEndpoint {
    fn subscribe(&self, topic: &Topic) {
        SubEndpoint::subscribe(self, &topic.to_string());
    }

    fn unsubscribe(&self, topic: &Topic) {
        SubEndpoint::unsubscribe(self, &topic.to_string());
    }
}

/// The stream-consumer task of one front-end.
pub struct MessageManager {
    task: JoinHandle<()>,
}

impl MessageManager {
    /// Wires the three streams, replays the current LIVE locations through
    /// the `location_added` path (so a late-joining front-end converges to
    /// the same state as the event-driven one), then starts consuming.
    ///
    /// `locations_sub` must be the same endpoint the registry's location
    /// bridge subscribes through; `locations_rx` is its merged stream and
    /// `broker_rx` the broker client's.
    pub async fn start<R>(
        config: Arc<Config>,
        registry: Arc<ConnectionRegistry>,
        root: Arc<R>,
        links: Arc<LocationLinks>,
        locations_sub: SubEndpoint,
        broker_rx: mpsc::UnboundedReceiver<(String, Bytes)>,
        locations_rx: mpsc::UnboundedReceiver<(String, Bytes)>,
    ) -> Result<Self, NetError>
    where
        R: FrontendRoot + 'static,
    {
        let (registry_sub, registry_rx) = SubEndpoint::new();
        registry_sub.subscribe("");
        registry_sub.connect(&config.location_manager.pub_address);

        let inner = Arc::new(Inner {
            config,
            registry,
            root,
            links,
            locations_sub,
            // Keeps the announcement subscription alive for the lifetime
            // of the manager.
            _registry_sub: registry_sub,
        });

        inner.bootstrap().await?;

        let task = tokio::spawn(run(Arc::clone(&inner), broker_rx, registry_rx, locations_rx));
        Ok(Self { task })
    }

    /// Stops consuming; used by the tests' unclean-kill paths.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner<R> {
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    root: Arc<R>,
    links: Arc<LocationLinks>,
    locations_sub: SubEndpoint,
    _registry_sub: SubEndpoint,
}

async fn run<R>(
    inner: Arc<Inner<R>>,
    mut broker_rx: mpsc::UnboundedReceiver<(String, Bytes)>,
    mut registry_rx: mpsc::UnboundedReceiver<(String, Bytes)>,
    mut locations_rx: mpsc::UnboundedReceiver<(String, Bytes)>,
) where
    R: FrontendRoot + 'static,
{
    loop {
        let frame = tokio::select! {
            frame = broker_rx.recv() => frame,
            frame = registry_rx.recv() => frame,
            frame = locations_rx.recv() => frame,
        };
        let Some((topic, body)) = frame else { return };
        inner.handle(&topic, &body).await;
    }
}

impl<R> Inner<R>
where
    R: FrontendRoot + 'static,
{
    async fn bootstrap(&self) -> Result<(), NetError> {
        let frame = encode_parts(&[b"get_locations_info"])?;
        let reply = tokio::time::timeout(
            REQUEST_TIMEOUT,
            request(&self.config.location_manager.rep_address, frame),
        )
        .await
        .map_err(|_| NetError::Malformed("location registry did not reply"))??;

        let snapshot: serde_json::Value = rmp_serde::from_slice(&reply)?;
        let Some(locations) = snapshot.as_object() else {
            return Err(NetError::Malformed("locations snapshot is not a map"));
        };
        for (name, metadata) in locations {
            let Ok(ident) = Ident::try_new(name.clone()) else {
                warn!(%name, "skipping location with empty ident");
                continue;
            };
            let metadata = metadata.as_object().cloned().unwrap_or_default();
            self.location_added(ident, metadata).await;
        }
        Ok(())
    }

    async fn handle(&self, topic: &str, body: &[u8]) {
        let topic = match Topic::parse(topic) {
            Ok(topic) => topic,
            Err(error) => {
                warn!(%error, "dropping frame with unroutable topic");
                return;
            }
        };
        debug!(%topic, "inbound cluster frame");
        match topic {
            Topic::SendByUid(uid) => {
                if let Some(envelope) = decode_envelope(body) {
                    // Local-only: replaying a broker frame must never
                    // re-publish it.
                    self.registry.deliver_to_uid(&uid, envelope);
                }
            }
            Topic::PublishToChannel(channel) => {
                if let Some(envelope) = decode_envelope(body) {
                    self.registry.publish_to_channel(&channel, &envelope, true);
                }
            }
            Topic::LocationAdded(ident) => {
                let metadata = decode_kwargs(body);
                self.location_added(ident, metadata).await;
            }
            Topic::LocationDisconnected(ident) => {
                self.location_removed(&ident).await;
            }
            Topic::PublicFromLocation(ident) => {
                if let Some(mut envelope) = decode_envelope(body) {
                    envelope.prefix_path(&self.config.outer_server.client_location_handler_path);
                    self.registry.publish_to_location(&ident, &envelope);
                }
            }
            Topic::PrivateFromLocation(ident, uid) => {
                if let Some(envelope) = decode_envelope(body) {
                    self.dispatch_private(&ident, &uid, envelope).await;
                }
            }
        }
    }

    async fn location_added(&self, ident: Ident, mut metadata: Kwargs) {
        if self.links.contains_key(&ident) {
            warn!(%ident, "location already known, ignoring announcement");
            return;
        }
        let Some(serde_json::Value::String(pull_address)) = metadata.remove("pull_address") else {
            warn!(%ident, "location announced without a pull address");
            return;
        };
        let Some(serde_json::Value::String(pub_address)) = metadata.remove("pub_address") else {
            warn!(%ident, "location announced without a pub address");
            return;
        };
        info!(%ident, "location is live");
        self.locations_sub.connect(&pub_address);
        self.links.insert(
            ident.clone(),
            LocationLink {
                push: PushEndpoint::connect(pull_address),
                pub_address,
                metadata: metadata.clone(),
            },
        );
        self.root.location_added(&ident, metadata).await;
    }

    async fn location_removed(&self, ident: &Ident) {
        let Some((_, link)) = self.links.remove(ident) else {
            warn!(%ident, "unknown location disconnected");
            return;
        };
        info!(%ident, "location is gone");
        link.push.close();
        self.locations_sub.disconnect(&link.pub_address);
        self.root.location_removed(ident).await;
    }

    /// Translates a private location message into a dispatch on the root
    /// with internal authority. The location is injected only when absent:
    /// a location may address another one (e.g. handing a user over).
    async fn dispatch_private(&self, ident: &Ident, uid: &Uid, mut envelope: Envelope) {
        envelope.prefix_path(&self.config.outer_server.location_handler_path);
        if !envelope.kwargs.contains_key("location") {
            envelope.kwargs.insert(
                "location".to_owned(),
                serde_json::Value::String(ident.to_string()),
            );
        }
        match serde_json::to_value(uid) {
            Ok(value) => {
                envelope.kwargs.insert("uid".to_owned(), value);
            }
            Err(error) => {
                warn!(%error, "cannot encode uid into kwargs");
                return;
            }
        }
        let path = Path::parse(&envelope.path);
        if let Err(error) = dispatch_with_loopback(
            self.root.as_ref(),
            self.root.loopback(),
            &path,
            envelope.kwargs,
            Sign::Internal,
        )
        .await
        {
            warn!(%error, "private location message dispatch failed");
        }
    }
}

fn decode_envelope(body: &[u8]) -> Option<Envelope> {
    match Envelope::from_bytes(body) {
        Ok(envelope) => Some(envelope),
        Err(error) => {
            warn!(%error, "dropping undecodable cluster envelope");
            None
        }
    }
}

fn decode_kwargs(body: &[u8]) -> Kwargs {
    match rmp_serde::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => Kwargs::new(),
    }
}
