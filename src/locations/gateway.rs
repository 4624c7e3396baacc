//! The location gateway: fronts a location process to the cluster.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CONNECT, DISCONNECT, HEARTBEAT};
use crate::config::Config;
use crate::dispatch::{Node, Path, Sign, dispatch};
use crate::domain::{Ident, Uid};
use crate::envelope::{Envelope, Kwargs};
use crate::net::{
    NetError, PubEndpoint, PullEndpoint, PushEndpoint, decode_parts, encode_parts, request,
};
use crate::topic::Topic;

/// Timeout of the CONNECT handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Linger granted to the DISCONNECT notification on shutdown.
const DISCONNECT_LINGER: Duration = Duration::from_secs(2);

/// A gateway failure.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The registry refused CONNECT: the ident is already LIVE elsewhere.
    /// The hosting process must exit non-zero.
    #[error("ident '{0}' is already live in the cluster")]
    DuplicateIdent(Ident),
    /// The registry did not answer the CONNECT request in time.
    #[error("location registry did not reply to connect")]
    RegistryTimeout,
    /// The CONNECT reply was not a boolean.
    #[error("cannot decode registry reply: {0}")]
    BadReply(#[from] rmp_serde::decode::Error),
    /// Socket-level failure.
    #[error(transparent)]
    Net(#[from] NetError),
}

/// The cluster front of one location process.
///
/// Registers with the location registry, emits heartbeats, dispatches
/// inbound envelopes on the location root, and publishes public/private
/// messages towards the front-ends.
pub struct Gateway {
    ident: Ident,
    messages: PubEndpoint,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    _pull: PullEndpoint,
    registry_push: PushEndpoint,
    heartbeat_period: Duration,
}

impl Gateway {
    /// Binds the location's own endpoints and registers with the registry.
    ///
    /// `metadata` is merged with the ident and the actually bound
    /// addresses and becomes the location's registration data. A refused
    /// registration is [`GatewayError::DuplicateIdent`].
    pub async fn connect(
        config: &Config,
        ident: Ident,
        pub_address: &str,
        pull_address: &str,
        metadata: Kwargs,
    ) -> Result<Self, GatewayError> {
        let messages = PubEndpoint::bind(pub_address).await?;
        let (pull, inbound) = PullEndpoint::bind(pull_address).await?;

        let mut data = metadata;
        data.insert("ident".to_owned(), serde_json::json!(ident.to_string()));
        data.insert(
            "pub_address".to_owned(),
            serde_json::json!(messages.local_addr().to_string()),
        );
        data.insert(
            "pull_address".to_owned(),
            serde_json::json!(pull.local_addr().to_string()),
        );
        let body =
            rmp_serde::to_vec_named(&serde_json::Value::Object(data)).map_err(NetError::from)?;
        let frame = encode_parts(&[
            CONNECT.as_bytes(),
            ident.to_string().as_bytes(),
            &body,
        ])?;

        let reply = tokio::time::timeout(
            CONNECT_TIMEOUT,
            request(&config.location_manager.rep_address, frame),
        )
        .await
        .map_err(|_| GatewayError::RegistryTimeout)??;
        let accepted: bool = rmp_serde::from_slice(&reply)?;
        if !accepted {
            return Err(GatewayError::DuplicateIdent(ident));
        }
        info!(%ident, "location registered");

        let registry_push = PushEndpoint::connect(config.location_manager.pull_address.clone());
        Ok(Self {
            ident,
            messages,
            inbound: Mutex::new(Some(inbound)),
            _pull: pull,
            registry_push,
            heartbeat_period: config.location.heartbeat_period(),
        })
    }

    /// The location's ident.
    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    /// The actually bound pub address.
    pub fn pub_address(&self) -> std::net::SocketAddr {
        self.messages.local_addr()
    }

    /// Emits heartbeats and dispatches inbound envelopes on `root` until
    /// `shutdown` fires, then notifies the registry with a bounded linger.
    ///
    /// Dispatch errors are logged and swallowed; an envelope's declared
    /// sign is honored and defaults to internal.
    pub async fn run<R>(&self, root: &R, shutdown: CancellationToken)
    where
        R: Node,
    {
        let mut inbound = match self.inbound.lock().await.take() {
            Some(inbound) => inbound,
            None => {
                warn!(ident = %self.ident, "gateway run() called twice");
                return;
            }
        };

        // The heartbeat shares the loop, so an aborted gateway falls
        // silent and the registry sweeps it out.
        let heartbeat = encode_parts(&[HEARTBEAT.as_bytes(), self.ident.to_string().as_bytes()]);
        let mut heartbeats = tokio::time::interval(self.heartbeat_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeats.tick() => {
                    if let Ok(frame) = &heartbeat {
                        self.registry_push.send(frame.clone());
                    }
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    self.dispatch_frame(root, &frame).await;
                }
            }
        }

        self.send_disconnect().await;
    }

    async fn dispatch_frame<R>(&self, root: &R, frame: &[u8])
    where
        R: Node,
    {
        let envelope = match decode_parts(frame) {
            Ok(parts) if parts.len() == 1 => match Envelope::from_bytes(&parts[0]) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(%error, "undecodable envelope on location input");
                    return;
                }
            },
            Ok(_) => {
                warn!("location input frame is not a single envelope");
                return;
            }
            Err(error) => {
                warn!(%error, "bad frame on location input");
                return;
            }
        };
        debug!(path = %envelope.path, "location inbound dispatch");
        let sign = envelope.sign.unwrap_or(Sign::Internal);
        let path = Path::parse(&envelope.path);
        if let Err(error) = dispatch(root, &path, envelope.kwargs, sign).await {
            warn!(%error, "location dispatch failed");
        }
    }

    async fn send_disconnect(&self) {
        let frame = match encode_parts(&[
            DISCONNECT.as_bytes(),
            self.ident.to_string().as_bytes(),
        ]) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        self.registry_push.send(frame);
        if !self.registry_push.flush(DISCONNECT_LINGER).await {
            warn!(ident = %self.ident, "disconnect notification may be lost");
        }
    }

    /// Publishes towards every user attached to this location.
    pub fn publish_public(&self, envelope: &Envelope) {
        let topic = Topic::PublicFromLocation(self.ident.clone());
        self.publish(&topic, envelope);
    }

    /// Publishes towards one attached user.
    pub fn publish_private(&self, uid: &Uid, envelope: &Envelope) {
        let topic = Topic::PrivateFromLocation(self.ident.clone(), uid.clone());
        self.publish(&topic, envelope);
    }

    fn publish(&self, topic: &Topic, envelope: &Envelope) {
        match envelope.to_bytes() {
            Ok(body) => self.messages.publish(&topic.to_string(), &body),
            Err(error) => warn!(%error, %topic, "cannot encode location publication"),
        }
    }
}
