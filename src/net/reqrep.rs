//! One-shot request/reply.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::warn;

use super::NetError;
use crate::codec::FrameCodec;

/// Connects, sends one frame, awaits one reply, closes.
pub async fn request(addr: &str, frame: Bytes) -> Result<Bytes, NetError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed.send(frame).await?;
    match framed.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(error)) => Err(error.into()),
        None => Err(NetError::Malformed("connection closed before reply")),
    }
}

/// One inbound request; the handler answers through `reply`.
pub struct RepRequest {
    /// The request frame body.
    pub frame: Bytes,
    /// Channel for the single reply frame.
    pub reply: oneshot::Sender<Bytes>,
}

/// Bind-side reply endpoint: one reply per request, per connection, in
/// order.
pub struct RepEndpoint {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RepEndpoint {
    /// Binds and starts accepting requesters.
    pub async fn bind(addr: &str) -> Result<(Self, mpsc::UnboundedReceiver<RepRequest>), NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "rep endpoint accept failed");
                        continue;
                    }
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, FrameCodec::new());
                    while let Some(frame) = framed.next().await {
                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(error) => {
                                warn!(%error, "bad frame on rep endpoint");
                                return;
                            }
                        };
                        let (reply_tx, reply_rx) = oneshot::channel();
                        if tx
                            .send(RepRequest {
                                frame,
                                reply: reply_tx,
                            })
                            .is_err()
                        {
                            return;
                        }
                        match reply_rx.await {
                            Ok(reply) => {
                                if framed.send(reply).await.is_err() {
                                    return;
                                }
                            }
                            // Handler dropped the request; nothing sane to
                            // answer, drop the connection.
                            Err(_) => return,
                        }
                    }
                });
            }
        });

        Ok((
            Self {
                local_addr,
                accept_task,
            },
            rx,
        ))
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RepEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
