//! The client-facing TCP server.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionRegistry, ConnectionSender, FrontendRoot};
use crate::codec::FrameCodec;
use crate::dispatch::{DispatchError, Path, Sign, dispatch_with_loopback};
use crate::domain::ConnectionId;
use crate::envelope::Envelope;

/// Error code sent when a dispatch lacked the required sign.
pub const SIGN_ERROR: &str = "sign_error";
/// Error code sent when the front-end is at capacity.
pub const MAX_CONNECTIONS_ERROR: &str = "max_connections_error";
/// Error code sent when a client-originated dispatch hit a topology error.
pub const RECEIVER_ERROR: &str = "receiver_error";

/// The client TCP acceptor of one front-end.
pub struct FrontendServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl FrontendServer {
    /// Binds the client port.
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts clients until `shutdown` fires.
    ///
    /// An accept at capacity is rejected before any per-connection setup:
    /// a best-effort `error` envelope, then close.
    pub async fn serve<R>(
        self,
        registry: Arc<ConnectionRegistry>,
        root: Arc<R>,
        max_conn: Option<usize>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>
    where
        R: FrontendRoot + 'static,
    {
        info!(addr = %self.local_addr, "front-end listening");
        let mut next_id: u64 = 0;
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                },
            };

            if let Some(max) = max_conn {
                if registry.connection_count() >= max {
                    warn!(max, "connection limit reached, rejecting client");
                    tokio::spawn(reject(stream));
                    continue;
                }
            }

            next_id += 1;
            let id = ConnectionId::new(next_id);
            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            if let Err(error) = registry.add(ConnectionSender::new(id, outbound)) {
                warn!(%error, "cannot register connection");
                continue;
            }
            tokio::spawn(run_connection(
                stream,
                id,
                Arc::clone(&registry),
                Arc::clone(&root),
                outbound_rx,
            ));
        }
    }
}

async fn reject(stream: TcpStream) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    if let Ok(body) = Envelope::error(MAX_CONNECTIONS_ERROR).to_bytes() {
        let _ = framed.send(Bytes::from(body)).await;
    }
}

async fn run_connection<R>(
    stream: TcpStream,
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    root: Arc<R>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) where
    R: FrontendRoot + 'static,
{
    debug!(%id, "client connected");
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            match envelope.to_bytes() {
                Ok(body) => {
                    if sink.send(Bytes::from(body)).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "cannot encode outbound envelope"),
            }
        }
    });

    // Inbound frames dispatch sequentially: the next message of this
    // connection is not read until the previous dispatch settled.
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%id, %error, "protocol error, closing connection");
                break;
            }
        };
        let envelope = match Envelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%id, %error, "undecodable envelope, closing connection");
                break;
            }
        };

        // Authority is derived from the uid binding; anything the client
        // claimed in the frame is discarded with the rest of the fields.
        let mut kwargs = envelope.kwargs;
        kwargs.insert("conn".to_owned(), serde_json::json!(id.into_inner()));
        let sign = match registry.uid_of(id) {
            Some(uid) => {
                match serde_json::to_value(&uid) {
                    Ok(value) => {
                        kwargs.insert("uid".to_owned(), value);
                    }
                    Err(error) => warn!(%error, "cannot encode uid into kwargs"),
                }
                Sign::User
            }
            None => Sign::None,
        };

        let path = Path::parse(&envelope.path);
        match dispatch_with_loopback(root.as_ref(), root.loopback(), &path, kwargs, sign).await {
            Ok(()) => {}
            Err(error @ DispatchError::SignDenied { .. }) => {
                warn!(%id, %error, "dispatch denied");
                registry.send_to(id, Envelope::error(SIGN_ERROR));
            }
            Err(error @ DispatchError::Handler { .. }) => {
                warn!(%id, %error, "handler failed");
            }
            Err(error) => {
                warn!(%id, %error, "dispatch failed");
                registry.send_to(id, Envelope::error(RECEIVER_ERROR));
            }
        }
    }

    if let Err(error) = registry.remove(id) {
        warn!(%id, %error, "teardown failed");
    }
    // The registry no longer holds the sender, so the writer drains what
    // is queued and exits on its own.
    drop(writer);
    debug!(%id, "client disconnected");
}
