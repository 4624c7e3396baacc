//! Unidirectional frame pipes with fan-in on the bind side.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{trace, warn};

use super::{NetError, RECONNECT_DELAY, SEND_QUEUE};
use crate::codec::FrameCodec;

enum PushOp {
    Frame(Bytes),
    Flush(oneshot::Sender<()>),
}

/// Connect-side pipe writer. Cloning shares the underlying link.
///
/// Reconnects forever; frames sent while the peer is unreachable (or while
/// the queue is full) are dropped - the fabric is best-effort.
#[derive(Clone)]
pub struct PushEndpoint {
    ops: mpsc::Sender<PushOp>,
    task: std::sync::Arc<JoinHandle<()>>,
}

impl PushEndpoint {
    /// Starts the connection task towards a [`PullEndpoint`].
    pub fn connect(addr: impl Into<String>) -> Self {
        let (ops, rx) = mpsc::channel(SEND_QUEUE);
        let task = std::sync::Arc::new(tokio::spawn(run_push(addr.into(), rx)));
        Self { ops, task }
    }

    /// Queues a frame; drops it if the link is saturated or gone.
    pub fn send(&self, frame: Bytes) {
        if self.ops.try_send(PushOp::Frame(frame)).is_err() {
            trace!("dropping frame on saturated push link");
        }
    }

    /// Waits until everything queued so far is written to the socket.
    ///
    /// Best-effort: returns `false` when the link cannot confirm in time.
    /// Used for the gateway's DISCONNECT linger.
    pub async fn flush(&self, timeout: std::time::Duration) -> bool {
        let (ack, done) = oneshot::channel();
        if self.ops.send(PushOp::Flush(ack)).await.is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(())))
    }

    /// Tears the link down, dropping anything still queued.
    pub fn close(&self) {
        self.task.abort();
    }
}

async fn run_push(addr: String, mut ops: mpsc::Receiver<PushOp>) {
    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(_) => {
                // Drain while backing off so a dead peer does not back the
                // queue up forever; flushes are answered vacuously.
                let backoff = tokio::time::sleep(RECONNECT_DELAY);
                tokio::pin!(backoff);
                loop {
                    tokio::select! {
                        _ = &mut backoff => break,
                        op = ops.recv() => match op {
                            None => return,
                            Some(PushOp::Flush(ack)) => {
                                let _ = ack.send(());
                            }
                            Some(PushOp::Frame(_)) => {
                                trace!(%addr, "dropping frame while peer is unreachable");
                            }
                        },
                    }
                }
                continue;
            }
        };
        let mut framed = Framed::new(stream, FrameCodec::new());
        loop {
            match ops.recv().await {
                None => {
                    let _ = framed.flush().await;
                    return;
                }
                Some(PushOp::Frame(frame)) => {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(PushOp::Flush(ack)) => {
                    let _ = framed.flush().await;
                    let _ = ack.send(());
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Bind-side pipe reader: merges frames from every connected pusher.
pub struct PullEndpoint {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl PullEndpoint {
    /// Binds and starts accepting pushers; the receiver yields raw frame
    /// bodies in per-pusher FIFO order.
    pub async fn bind(addr: &str) -> Result<(Self, mpsc::UnboundedReceiver<Bytes>), NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "pull endpoint accept failed");
                        continue;
                    }
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut frames = Framed::new(stream, FrameCodec::new());
                    while let Some(frame) = frames.next().await {
                        match frame {
                            Ok(frame) => {
                                if tx.send(frame).is_err() {
                                    return;
                                }
                            }
                            Err(error) => {
                                warn!(%error, "bad frame on pull endpoint");
                                return;
                            }
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

impl Drop for PullEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
